use chrono::{Duration, TimeZone, Utc};
use sensor_store_core::chunker::{center, minmeanmax, timestamp_minmeanmax};
use sensor_store_core::env::{EnvManager, EnvManagerOptions};
use sensor_store_core::timestamp_store::{Bucket, TimestampStore};

fn fresh_store() -> (tempfile::TempDir, TimestampStore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.mdb");
    let env = EnvManager::open_with_options(
        &path,
        EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 },
    )
    .unwrap();
    let store = TimestampStore::open(env, "data_s").unwrap();
    (dir, store)
}

fn decode_f32(b: &[u8]) -> sensor_store_core::error::Result<Vec<f64>> {
    Ok(vec![f32::from_le_bytes(b.try_into().unwrap()) as f64])
}

/// 21 samples at 1 Hz, values 0..20 — exactly three 7-second windows with no
/// trailing partial window, so every window's center/mean/min/max can be
/// hand-checked.
fn seed(store: &TimestampStore) -> chrono::DateTime<Utc> {
    let t0 = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    for i in 0..21 {
        let t = t0 + Duration::seconds(i);
        store.write(t, &(i as f32).to_le_bytes(), false, None).unwrap();
    }
    t0
}

#[test]
fn mean_decimation_averages_each_seven_second_window() {
    let (_dir, store) = fresh_store();
    let t0 = seed(&store);

    let rows = store
        .range_decimated(Bucket::Seconds(7.0), None, None, None, center, sensor_store_core::chunker::mean, decode_f32)
        .unwrap();

    assert_eq!(rows.len(), 3);
    for (k, (t, v)) in rows.iter().enumerate() {
        let window: Vec<f64> = (0..7).map(|j| (k * 7 + j) as f64).collect();
        let expected_mean = window.iter().sum::<f64>() / window.len() as f64;
        assert!((v[0] - expected_mean).abs() < 1e-9, "window {k}: {v:?} vs {expected_mean}");
        // center() is first + (last - first) / 2 over the window's own
        // timestamps, not the bucket's nominal midpoint.
        assert_eq!(*t, t0 + Duration::seconds((k as i64) * 7 + 3));
    }
}

#[test]
fn minmeanmax_decimation_triples_each_window_at_first_center_last() {
    let (_dir, store) = fresh_store();
    let t0 = seed(&store);

    let rows = store
        .range_decimated(Bucket::Seconds(7.0), None, None, None, timestamp_minmeanmax, minmeanmax, decode_f32)
        .unwrap();

    assert_eq!(rows.len(), 3 * 3);
    let (first_t, first_v) = &rows[0];
    let (center_t, center_v) = &rows[1];
    let (last_t, last_v) = &rows[2];
    assert_eq!(*first_t, t0);
    assert_eq!(*first_v, vec![0.0]);
    assert_eq!(*center_t, t0 + Duration::seconds(3));
    assert_eq!(*center_v, vec![3.0]);
    assert_eq!(*last_t, t0 + Duration::seconds(6));
    assert_eq!(*last_v, vec![6.0]);

    let (second_min_t, second_min_v) = &rows[3];
    let (_, second_mean_v) = &rows[4];
    let (_, second_max_v) = &rows[5];
    assert_eq!(*second_min_t, t0 + Duration::seconds(7));
    assert_eq!(*second_min_v, vec![7.0]);
    assert_eq!(*second_mean_v, vec![10.0]);
    assert_eq!(*second_max_v, vec![13.0]);
}
