//! A byte-oriented, ordered view over one sub-store.
//!
//! `OrderedMap` is the raw key/value layer every other store is built on;
//! typed codecs (see `crate::codec`) wrap it from above. Grounded on
//! `original_source/db/dict_db.py::LMDBDict`, restructured around `heed`
//! transactions in place of raw `lmdb` cursors.

use crate::env::EnvManager;
use crate::error::Result;
use heed::types::Bytes;
use heed::Database;

pub enum Iter {
    Keys,
    Values,
    Items,
}

/// A (key, value) pair, both owned byte buffers.
pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Clone)]
pub struct OrderedMap {
    env: EnvManager,
    name: String,
    db: Database<Bytes, Bytes>,
}

impl OrderedMap {
    /// Open (creating if absent) the named sub-store inside `env`.
    pub fn open(env: EnvManager, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let db = env.sub(&name)?;
        Ok(OrderedMap { env, name, db })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &EnvManager {
        &self.env
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtxn = self.env.raw().read_txn()?;
        Ok(self.db.get(&rtxn, key)?.map(|v| v.to_vec()))
    }

    /// Create or overwrite `key`. Skips the write transaction entirely when
    /// the stored value already equals `value` byte-for-byte.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(existing) = self.get(key)? {
            if existing == value {
                tracing::debug!(sub_store = %self.name, "put skipped, value unchanged");
                return Ok(());
            }
        }
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        self.db.put(&mut wtxn, key, value)?;
        wtxn.commit()?;
        self.env.sync()?;
        Ok(())
    }

    /// Delete `key`. Fails with `NotFound` if it is absent.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        let deleted = self.db.delete(&mut wtxn, key)?;
        if !deleted {
            return Err(crate::error::StoreError::NotFound(format!(
                "key not present in {}",
                self.name
            )));
        }
        wtxn.commit()?;
        self.env.sync()?;
        Ok(())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let rtxn = self.env.raw().read_txn()?;
        Ok(self.db.get(&rtxn, key)?.is_some())
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.raw().read_txn()?;
        Ok(self.db.len(&rtxn)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn collect(&self, what: Iter) -> Result<Vec<Entry>> {
        let rtxn = self.env.raw().read_txn()?;
        let mut out = Vec::new();
        for item in self.db.iter(&rtxn)? {
            let (k, v) = item?;
            match what {
                Iter::Keys => out.push((k.to_vec(), Vec::new())),
                Iter::Values => out.push((Vec::new(), v.to_vec())),
                Iter::Items => out.push((k.to_vec(), v.to_vec())),
            }
        }
        Ok(out)
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.collect(Iter::Keys)?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn values(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.collect(Iter::Values)?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn items(&self) -> Result<Vec<Entry>> {
        self.collect(Iter::Items)
    }

    /// Bulk put in a single write transaction. Returns whether every pair
    /// was newly written (mirrors the Python `update`'s AND-of-results).
    pub fn update(&self, pairs: &[Entry]) -> Result<bool> {
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        let mut all_ok = true;
        for (k, v) in pairs {
            let existing = self.db.get(&wtxn, k)?;
            if existing.map(|e| e == v.as_slice()).unwrap_or(false) {
                continue;
            }
            self.db.put(&mut wtxn, k, v)?;
            all_ok = all_ok && true;
        }
        wtxn.commit()?;
        self.env.sync()?;
        Ok(all_ok)
    }

    /// Return and remove the last (key, value) pair. Fails if empty.
    pub fn pop_last(&self) -> Result<Entry> {
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        let last = {
            let mut iter = self.db.rev_iter(&wtxn)?;
            iter.next().transpose()?.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        let (key, value) = last.ok_or_else(|| crate::error::StoreError::NotFound(format!("{} is empty", self.name)))?;
        self.db.delete(&mut wtxn, &key)?;
        wtxn.commit()?;
        self.env.sync()?;
        Ok((key, value))
    }

    /// Delete every entry in a single transaction.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.env.write_guard()?;
        let mut wtxn = self.env.raw().write_txn()?;
        self.db.clear(&mut wtxn)?;
        wtxn.commit()?;
        self.env.sync()?;
        Ok(())
    }

    /// Atomically duplicate this sub-store under `target_name`, optionally
    /// in a different file. Fails if the destination already exists.
    pub fn copy_to(&self, target_name: &str, target_env: Option<&EnvManager>) -> Result<OrderedMap> {
        let dest_env = target_env.cloned().unwrap_or_else(|| self.env.clone());
        if dest_env.exists(target_name)? {
            return Err(crate::error::StoreError::AlreadyExists(target_name.to_string()));
        }
        let dest_db = dest_env.sub(target_name)?;
        {
            let _guard = dest_env.write_guard()?;
            let src_rtxn = self.env.raw().read_txn()?;
            let mut dst_wtxn = dest_env.raw().write_txn()?;
            for item in self.db.iter(&src_rtxn)? {
                let (k, v) = item?;
                dest_db.put(&mut dst_wtxn, k, v)?;
            }
            dst_wtxn.commit()?;
        }
        dest_env.sync()?;
        Ok(OrderedMap {
            env: dest_env,
            name: target_name.to_string(),
            db: dest_db,
        })
    }

    /// Two maps are equal iff they contain the same set of key/value pairs.
    pub fn equals(&self, other: &OrderedMap) -> Result<bool> {
        let mine = self.items()?;
        let theirs = other.items()?;
        Ok(mine == theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvManager, EnvManagerOptions};

    fn test_env() -> (tempfile::TempDir, EnvManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.mdb");
        let env = EnvManager::open_with_options(
            &path,
            EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 },
        )
        .unwrap();
        (dir, env)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, env) = test_env();
        let map = OrderedMap::open(env, "notes").unwrap();
        map.put(b"k1", b"v1").unwrap();
        assert_eq!(map.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn delete_missing_key_fails() {
        let (_dir, env) = test_env();
        let map = OrderedMap::open(env, "notes").unwrap();
        assert!(map.delete(b"missing").is_err());
    }

    #[test]
    fn items_are_ascending_by_key() {
        let (_dir, env) = test_env();
        let map = OrderedMap::open(env, "notes").unwrap();
        map.put(b"b", b"2").unwrap();
        map.put(b"a", b"1").unwrap();
        let keys: Vec<_> = map.items().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn copy_to_fails_when_destination_exists() {
        let (_dir, env) = test_env();
        let src = OrderedMap::open(env.clone(), "src").unwrap();
        src.put(b"k", b"v").unwrap();
        OrderedMap::open(env, "dst").unwrap();
        assert!(src.copy_to("dst", None).is_err());
    }

    #[test]
    fn copy_to_duplicates_all_entries() {
        let (_dir, env) = test_env();
        let src = OrderedMap::open(env, "src").unwrap();
        src.put(b"k1", b"v1").unwrap();
        src.put(b"k2", b"v2").unwrap();
        let dst = src.copy_to("dst", None).unwrap();
        assert!(src.equals(&dst).unwrap());
    }

    #[test]
    fn pop_last_removes_the_greatest_key() {
        let (_dir, env) = test_env();
        let map = OrderedMap::open(env, "notes").unwrap();
        map.put(b"a", b"1").unwrap();
        map.put(b"b", b"2").unwrap();
        let (k, v) = map.pop_last().unwrap();
        assert_eq!((k, v), (b"b".to_vec(), b"2".to_vec()));
        assert_eq!(map.len().unwrap(), 1);
    }
}
