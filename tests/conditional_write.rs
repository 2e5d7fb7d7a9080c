use chrono::Duration;
use sensor_store_core::catalog::SensorCatalog;
use sensor_store_core::codec::Value;
use sensor_store_core::env::{EnvManager, EnvManagerOptions};

fn fresh_catalog() -> (tempfile::TempDir, SensorCatalog) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.mdb");
    let env = EnvManager::open_with_options(
        &path,
        EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 16 },
    )
    .unwrap();
    (dir, SensorCatalog::from_env(env))
}

/// Value-change suppression followed by a max-age override.
#[test]
fn unchanged_writes_are_suppressed_until_forced_or_stale() {
    let (_dir, catalog) = fresh_catalog();
    let sensor = catalog.get("s").unwrap();
    let one = Value::Bytes(b"1".to_vec());
    let t0 = chrono::Utc::now();

    assert!(sensor.write(t0, &one, false, None).unwrap());
    assert_eq!(sensor.statistics().unwrap().count, 1);

    let t1 = t0 + Duration::seconds(60);
    assert!(!sensor.write(t1, &one, true, None).unwrap());
    assert_eq!(sensor.statistics().unwrap().count, 1);

    assert!(sensor.write(t1, &one, false, None).unwrap());
    assert_eq!(sensor.statistics().unwrap().count, 2);

    let t2 = t0 + Duration::seconds(86_400);
    assert!(sensor.write(t2, &one, true, Some(Duration::seconds(3_600))).unwrap());
    assert_eq!(sensor.statistics().unwrap().count, 3);
}
