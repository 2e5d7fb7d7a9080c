//! Timestamp key encoding and duration helpers.
//!
//! Keys in a [`crate::timestamp_store::TimestampStore`] are 8-byte big-endian
//! unsigned integers holding microseconds since the Unix epoch, matching
//! `original_source/db/packer.py::DatetimePacker` so that lexicographic byte
//! order equals chronological order.

use crate::error::{Result, StoreError};
use chrono::{DateTime, TimeZone, Utc};

pub const TIMESTAMP_KEY_LEN: usize = 8;

/// Encode an instant as the 8-byte big-endian microsecond key.
///
/// Fails if `t` is before the Unix epoch (§3: "timestamps before the epoch
/// are not representable").
pub fn encode_timestamp(t: DateTime<Utc>) -> Result<[u8; TIMESTAMP_KEY_LEN]> {
    let micros = t.timestamp_micros();
    if micros < 0 {
        return Err(StoreError::invalid(
            "timestamps before the Unix epoch are not representable",
        ));
    }
    Ok((micros as u64).to_be_bytes())
}

/// Decode the 8-byte big-endian microsecond key back into an instant.
pub fn decode_timestamp(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let arr: [u8; TIMESTAMP_KEY_LEN] = bytes
        .try_into()
        .map_err(|_| StoreError::invalid(format!("timestamp key must be {TIMESTAMP_KEY_LEN} bytes, got {}", bytes.len())))?;
    let micros = u64::from_be_bytes(arr);
    Utc.timestamp_micros(micros as i64)
        .single()
        .ok_or_else(|| StoreError::invalid("timestamp key out of range"))
}

/// Parse an ISO-8601 string (as produced by `DateTime::to_rfc3339`-style
/// formatting, or a bare `YYYY-MM-DDTHH:MM:SS[.ffffff]` local-naive form
/// assumed UTC) into an instant. Used at the edges where callers hand in
/// timespans as strings.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(StoreError::invalid(format!("'{s}' is not a recognized timestamp")))
}

/// Format an instant the way `ExportEngine` writes the `"Time"` column/key:
/// seconds-precision ISO-8601 without a trailing offset designator when the
/// sub-second part is zero, matching `datetime.isoformat()` on a naive UTC
/// value as used throughout `original_source`.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    if t.timestamp_subsec_micros() == 0 {
        t.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        t.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn round_trips_through_bytes() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap() + Duration::microseconds(123_456);
        let enc = encode_timestamp(t).unwrap();
        assert_eq!(decode_timestamp(&enc).unwrap(), t);
    }

    #[test]
    fn byte_order_matches_chronological_order() {
        let t0 = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::seconds(1);
        assert!(encode_timestamp(t0).unwrap() < encode_timestamp(t1).unwrap());
    }

    #[test]
    fn rejects_pre_epoch() {
        let t = Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap();
        assert!(encode_timestamp(t).is_err());
    }

    #[test]
    fn formats_without_fraction_when_whole_second() {
        let t = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 3).unwrap();
        assert_eq!(format_timestamp(t), "2000-01-01T00:00:03");
    }
}
