//! An [`crate::ordered_map::OrderedMap`] whose keys are fixed to the
//! big-endian microsecond timestamp codec, plus the timestamp-indexed
//! operations spec'd for sensor data: conditional write, ranged reads,
//! decimation, and last-observation-carried-forward point queries.
//!
//! Grounded on `original_source/db/timestamp_db.py::TimestampBytesDB`; the
//! cursor dance in [`TimestampStore::write`] is a direct port of
//! `write_value`'s "seek to first key ≥ t, then step back" algorithm.

use crate::chunker::{TimestampChunker, ValueChunker};
use crate::env::EnvManager;
use crate::error::{Result, StoreError};
use crate::time::{decode_timestamp, encode_timestamp};
use chrono::{DateTime, Duration, Utc};
use heed::types::Bytes;
use heed::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum What {
    Keys,
    Values,
    Items,
}

/// `bucket` argument to [`TimestampStore::range_decimated`].
#[derive(Debug, Clone, Copy)]
pub enum Bucket {
    Seconds(f64),
    /// `duration / limit`, per `_get_timespan_chunked`'s `"auto"` mode.
    Auto,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub count: u64,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TimestampStore {
    env: EnvManager,
    name: String,
    db: Database<Bytes, Bytes>,
}

impl TimestampStore {
    pub fn open(env: EnvManager, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let db = env.sub(&name)?;
        Ok(TimestampStore { env, name, db })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &EnvManager {
        &self.env
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.raw().read_txn()?;
        Ok(self.db.len(&rtxn)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn first_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let rtxn = self.env.raw().read_txn()?;
        match self.db.first(&rtxn)? {
            Some((k, _)) => Ok(Some(decode_timestamp(k)?)),
            None => Ok(None),
        }
    }

    pub fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let rtxn = self.env.raw().read_txn()?;
        match self.db.last(&rtxn)? {
            Some((k, _)) => Ok(Some(decode_timestamp(k)?)),
            None => Ok(None),
        }
    }

    pub fn first_value(&self) -> Result<Option<Vec<u8>>> {
        let rtxn = self.env.raw().read_txn()?;
        Ok(self.db.first(&rtxn)?.map(|(_, v)| v.to_vec()))
    }

    pub fn last_value(&self) -> Result<Option<Vec<u8>>> {
        let rtxn = self.env.raw().read_txn()?;
        Ok(self.db.last(&rtxn)?.map(|(_, v)| v.to_vec()))
    }

    /// Entry with the greatest key `<= t`, if any.
    fn floor_entry(&self, t: DateTime<Utc>) -> Result<Option<(DateTime<Utc>, Vec<u8>)>> {
        let target = encode_timestamp(t)?;
        let rtxn = self.env.raw().read_txn()?;
        for item in self.db.rev_iter(&rtxn)? {
            let (k, v) = item?;
            if k <= target.as_slice() {
                return Ok(Some((decode_timestamp(k)?, v.to_vec())));
            }
        }
        Ok(None)
    }

    /// Conditional write. Returns whether a write actually occurred.
    pub fn write(
        &self,
        t: DateTime<Utc>,
        value: &[u8],
        only_if_value_changed: bool,
        max_age: Option<Duration>,
    ) -> Result<bool> {
        if only_if_value_changed {
            if let Some((last_time, last_value)) = self.floor_entry(t)? {
                let must_check = match max_age {
                    Some(age) => (t - last_time) < age,
                    None => true,
                };
                if must_check && last_value == value {
                    tracing::debug!(sub_store = %self.name, "write skipped, value unchanged since {last_time}");
                    return Ok(false);
                }
            }
        }
        let key = encode_timestamp(t)?;
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        self.db.put(&mut wtxn, &key, value)?;
        wtxn.commit()?;
        self.env.sync()?;
        Ok(true)
    }

    /// Bulk, unconditional put of every pair in one write transaction.
    /// Returns whether every pair was newly written (mirrors the Python
    /// `update`'s AND-of-results).
    pub fn write_many(&self, pairs: &[(DateTime<Utc>, Vec<u8>)]) -> Result<bool> {
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        for (t, v) in pairs {
            let key = encode_timestamp(*t)?;
            self.db.put(&mut wtxn, &key, v)?;
        }
        wtxn.commit()?;
        self.env.sync()?;
        Ok(true)
    }

    /// Inclusive on both ends. Returns false if the window lies entirely
    /// outside the stored data.
    pub fn delete_range(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Result<bool> {
        let (first, last) = match (self.first_timestamp()?, self.last_timestamp()?) {
            (Some(f), Some(l)) => (f, l),
            _ => return Ok(false),
        };
        let since = since.unwrap_or(first);
        let until = until.unwrap_or(last);
        if since > until {
            return Err(StoreError::invalid(format!("{since} is not before {until}")));
        }
        if since > last || until < first {
            return Ok(false);
        }

        let since_bytes = encode_timestamp(since)?;
        let until_bytes = encode_timestamp(until)?;
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        let to_delete: Vec<Vec<u8>> = {
            let mut keys = Vec::new();
            for item in self.db.iter(&wtxn)? {
                let (k, _) = item?;
                if k >= since_bytes.as_slice() && k <= until_bytes.as_slice() {
                    keys.push(k.to_vec());
                }
            }
            keys
        };
        for key in &to_delete {
            self.db.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        self.env.sync()?;
        Ok(true)
    }

    /// `since <= t < until`, or `<= until` when `endpoint` is true. Absent
    /// `since`/`until` default to the first/last stored timestamp; an
    /// absent `until` implies `endpoint = true`.
    fn range_raw(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        endpoint: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(DateTime<Utc>, Vec<u8>)>> {
        let (first, last) = match (self.first_timestamp()?, self.last_timestamp()?) {
            (Some(f), Some(l)) => (f, l),
            _ => return Ok(Vec::new()),
        };
        let since = since.unwrap_or(first);
        let (until, endpoint) = match until {
            Some(u) => (u, endpoint),
            None => (last, true),
        };
        if since > last || until < first {
            return Ok(Vec::new());
        }
        if since > until {
            return Err(StoreError::invalid(format!("{since} is not before {until}")));
        }

        let rtxn = self.env.raw().read_txn()?;
        let mut out = Vec::new();
        for item in self.db.iter(&rtxn)? {
            let (k, v) = item?;
            let t = decode_timestamp(k)?;
            if t < since {
                continue;
            }
            if t > until || (!endpoint && t == until) {
                break;
            }
            out.push((t, v.to_vec()));
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn range(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        endpoint: bool,
        limit: Option<usize>,
        what: What,
    ) -> Result<Vec<(DateTime<Utc>, Vec<u8>)>> {
        let rows = self.range_raw(since, until, endpoint, limit)?;
        Ok(match what {
            What::Keys => rows.into_iter().map(|(t, _)| (t, Vec::new())).collect(),
            What::Values => rows.into_iter().map(|(t, v)| (t, v)).collect(),
            What::Items => rows,
        })
    }

    /// Decimate the covered timespan into fixed windows, mapping each
    /// window to 1 or 3 output points via `ts_chunker`/`val_chunker`.
    /// `decode` turns a raw stored value into its numeric fields so mean/
    /// median/min/max can operate index-wise, including on packed tuples.
    pub fn range_decimated(
        &self,
        bucket: Bucket,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: Option<usize>,
        ts_chunker: TimestampChunker,
        val_chunker: ValueChunker,
        decode: impl Fn(&[u8]) -> Result<Vec<f64>>,
    ) -> Result<Vec<(DateTime<Utc>, Vec<f64>)>> {
        let rows = self.range_raw(since, until, true, None)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let decimate_to = match bucket {
            Bucket::Seconds(s) => Duration::milliseconds((s * 1000.0) as i64),
            Bucket::Auto => {
                let limit = limit.ok_or_else(|| StoreError::invalid("bucket=\"auto\" requires a limit"))?;
                if limit == 0 {
                    return Err(StoreError::invalid("limit must be positive for bucket=\"auto\""));
                }
                let span = rows.last().unwrap().0 - rows.first().unwrap().0;
                span / limit as i32
            }
        };

        let mut out = Vec::new();
        let mut window_ts: Vec<DateTime<Utc>> = Vec::new();
        let mut window_vals: Vec<Vec<f64>> = Vec::new();
        let mut stop: Option<DateTime<Utc>> = None;

        let flush = |window_ts: &[DateTime<Utc>], window_vals: &[Vec<f64>], out: &mut Vec<(DateTime<Utc>, Vec<f64>)>| {
            let ts = ts_chunker(window_ts);
            let vals = val_chunker(window_vals);
            for (t, v) in ts.into_iter().zip(vals.into_iter()) {
                out.push((t, v));
            }
        };

        for (t, raw) in &rows {
            if let Some(stop_at) = stop {
                if *t >= stop_at {
                    flush(&window_ts, &window_vals, &mut out);
                    window_ts.clear();
                    window_vals.clear();
                    stop = None;
                }
            }
            if stop.is_none() {
                stop = Some(*t + decimate_to);
            }
            window_ts.push(*t);
            window_vals.push(decode(raw)?);
        }
        if !window_ts.is_empty() {
            flush(&window_ts, &window_vals, &mut out);
        }
        Ok(out)
    }

    /// LOCF point query. `times` must be monotonically non-decreasing.
    /// Bounded by `since`/`until`/`endpoint` like [`TimestampStore::range`].
    pub fn at(
        &self,
        times: &[DateTime<Utc>],
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        endpoint: bool,
        only_at_times: bool,
    ) -> Result<Vec<(DateTime<Utc>, Vec<u8>)>> {
        let mut out = Vec::new();
        for &tq in times {
            if let Some(s) = since {
                if tq < s {
                    continue;
                }
            }
            if let Some(u) = until {
                if tq > u || (!endpoint && tq == u) {
                    continue;
                }
            }
            if let Some((_, value)) = self.floor_entry(tq)? {
                out.push((tq, value));
            }
        }
        if !only_at_times {
            let stored = self.range_raw(since, until, endpoint, None)?;
            let requested: std::collections::HashSet<DateTime<Utc>> = times.iter().copied().collect();
            for (t, v) in stored {
                if !requested.contains(&t) {
                    out.push((t, v));
                }
            }
            out.sort_by_key(|(t, _)| *t);
        }
        Ok(out)
    }

    /// Walks backward from the last entry looking for a value that differs
    /// from the tail value; returns the timestamp of the entry immediately
    /// after that differing one (the start of the trailing equal-value
    /// run). Absent if no older, differing value exists — including when
    /// the store has a single entry or every entry shares the tail value.
    pub fn last_changed(&self) -> Result<Option<DateTime<Utc>>> {
        let rtxn = self.env.raw().read_txn()?;
        let mut iter = self.db.rev_iter(&rtxn)?;
        let (last_key, last_value) = match iter.next() {
            Some(item) => {
                let (k, v) = item?;
                (k.to_vec(), v.to_vec())
            }
            None => return Ok(None),
        };
        let mut oldest_equal = last_key;
        for item in iter {
            let (k, v) = item?;
            if v != last_value.as_slice() {
                return Ok(Some(decode_timestamp(&oldest_equal)?));
            }
            oldest_equal = k.to_vec();
        }
        Ok(None)
    }

    pub fn statistics(&self) -> Result<Statistics> {
        Ok(Statistics {
            count: self.len()?,
            since: self.first_timestamp()?,
            until: self.last_timestamp()?,
        })
    }
}
