//! The whole-file view: enumerate/fetch/delete sensors, plus the two
//! file-level collaborators (`notes`, `plot_groups`).
//!
//! Grounded on `original_source/db/sensor_db.py::Sensors`/`LMDBSensorStorage`.

use crate::codec::FormatDescriptor;
use crate::env::EnvManager;
use crate::error::Result;
use crate::ordered_map::OrderedMap;
use crate::sensor::{DataFormat, Sensor, DATA_PREFIX, FORMAT_PREFIX, META_PREFIX, NOTES_PREFIX};
use crate::timestamp_store::TimestampStore;
use std::collections::BTreeMap;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SensorStatistics {
    pub count: u64,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub meta: BTreeMap<String, serde_yaml::Value>,
    pub data_format: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileStatistics {
    pub filename: String,
    pub filesize: i64,
    pub sensors: BTreeMap<String, SensorStatistics>,
}

pub struct SensorCatalog {
    env: EnvManager,
}

impl SensorCatalog {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(SensorCatalog { env: EnvManager::open(path)? })
    }

    pub fn from_env(env: EnvManager) -> Self {
        SensorCatalog { env }
    }

    pub fn env(&self) -> &EnvManager {
        &self.env
    }

    /// Sensor names, derived from `data_`-prefixed sub-stores, in the
    /// enumeration order of the underlying file.
    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self
            .env
            .enumerate()?
            .into_iter()
            .filter_map(|name| name.strip_prefix(DATA_PREFIX).map(str::to_string))
            .collect())
    }

    /// Construct a `Sensor` view (no I/O beyond the sub-store handles).
    pub fn get(&self, name: &str) -> Result<Sensor> {
        Sensor::open(self.env.clone(), name, None)
    }

    /// Drop all four prefixed sub-stores for `name`. Missing ones are
    /// ignored.
    pub fn delete(&self, name: &str) -> Result<()> {
        for prefix in [DATA_PREFIX, META_PREFIX, FORMAT_PREFIX, NOTES_PREFIX] {
            self.env.drop_sub(&format!("{prefix}{name}"))?;
        }
        Ok(())
    }

    pub fn notes(&self) -> Result<TimestampStore> {
        TimestampStore::open(self.env.clone(), "notes")
    }

    pub fn plot_groups(&self) -> Result<PlotGroups> {
        Ok(PlotGroups { map: OrderedMap::open(self.env.clone(), "plot_groups")? })
    }

    pub fn statistics(&self) -> Result<FileStatistics> {
        let filesize = std::fs::metadata(self.env.path()).map(|m| m.len() as i64).unwrap_or(-1);
        let mut sensors = BTreeMap::new();
        for name in self.names()? {
            let sensor = self.get(&name)?;
            let stats = sensor.statistics()?;
            let meta = sensor.metadata().as_map()?;
            let data_format = match sensor.data_format()? {
                DataFormat::Fixed(d) => Some(d.to_descriptor_string()),
                DataFormat::Unfmt => None,
            };
            sensors.insert(
                name,
                SensorStatistics {
                    count: stats.count,
                    since: stats.since,
                    until: stats.until,
                    meta,
                    data_format,
                },
            );
        }
        Ok(FileStatistics {
            filename: self.env.path().display().to_string(),
            filesize,
            sensors,
        })
    }
}

/// Named regex patterns used by renderers to group sensors on one plot.
/// Grounded on `original_source/db/sensor_db.py::GroupDefinitions`
/// (`StringRegexpDB`): keys are group names, values are regex patterns
/// matched against sensor names.
pub struct PlotGroups {
    map: OrderedMap,
}

impl PlotGroups {
    pub fn set(&self, group_name: &str, pattern: &str) -> Result<()> {
        let packed = FormatDescriptor::Regex.pack(&crate::codec::Value::Str(pattern.to_string()))?;
        self.map.put(group_name.as_bytes(), &packed)
    }

    pub fn get(&self, group_name: &str) -> Result<Option<String>> {
        match self.map.get(group_name.as_bytes())? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|e| crate::error::StoreError::decode("plot_groups", e))?,
            )),
            None => Ok(None),
        }
    }

    pub fn names(&self) -> Result<Vec<String>> {
        self.map
            .keys()?
            .into_iter()
            .map(|k| String::from_utf8(k).map_err(|e| crate::error::StoreError::decode("plot_groups", e)))
            .collect()
    }

    /// Sensor names (from `all_sensor_names`) matching this group's regex.
    pub fn matching(&self, group_name: &str, all_sensor_names: &[String]) -> Result<Vec<String>> {
        let pattern = match self.get(group_name)? {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let re = regex::Regex::new(&pattern).map_err(|e| crate::error::StoreError::invalid(e.to_string()))?;
        Ok(all_sensor_names.iter().filter(|name| re.is_match(name)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::env::EnvManagerOptions;
    use chrono::Utc;

    fn test_catalog() -> (tempfile::TempDir, SensorCatalog) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.mdb");
        let env = EnvManager::open_with_options(
            &path,
            EnvManagerOptions { map_size: 16 * 1024 * 1024, max_sub_stores: 64 },
        )
        .unwrap();
        (dir, SensorCatalog::from_env(env))
    }

    #[test]
    fn catalog_consistency_name_present_iff_data_substore_exists() {
        let (_dir, catalog) = test_catalog();
        assert!(catalog.names().unwrap().is_empty());
        let sensor = catalog.get("temp").unwrap();
        sensor.write(Utc::now(), &Value::Float(1.0), false, None).unwrap();
        assert_eq!(catalog.names().unwrap(), vec!["temp".to_string()]);
    }

    #[test]
    fn delete_totality_removes_all_four_substores() {
        let (_dir, catalog) = test_catalog();
        let sensor = catalog.get("temp").unwrap();
        sensor.write(Utc::now(), &Value::Float(1.0), false, None).unwrap();
        sensor.metadata().set("label", &serde_yaml::Value::String("x".into())).unwrap();
        sensor.notes().add_short(Utc::now(), "note").unwrap();

        catalog.delete("temp").unwrap();

        for prefix in [DATA_PREFIX, META_PREFIX, FORMAT_PREFIX, NOTES_PREFIX] {
            assert!(!catalog.env().exists(&format!("{prefix}temp")).unwrap());
        }
    }

    #[test]
    fn plot_groups_matches_by_regex() {
        let (_dir, catalog) = test_catalog();
        catalog.get("temp_inside").unwrap().write(Utc::now(), &Value::Float(1.0), false, None).unwrap();
        catalog.get("temp_outside").unwrap().write(Utc::now(), &Value::Float(1.0), false, None).unwrap();
        catalog.get("humidity").unwrap().write(Utc::now(), &Value::Float(1.0), false, None).unwrap();

        let groups = catalog.plot_groups().unwrap();
        groups.set("temps", "^temp_.*").unwrap();

        let names = catalog.names().unwrap();
        let matched = groups.matching("temps", &names).unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn statistics_reports_per_sensor_counts() {
        let (_dir, catalog) = test_catalog();
        catalog.get("temp").unwrap().write(Utc::now(), &Value::Float(1.0), false, None).unwrap();
        let stats = catalog.statistics().unwrap();
        assert_eq!(stats.sensors["temp"].count, 1);
        assert_eq!(stats.sensors["temp"].data_format.as_deref(), Some("f"));
    }
}
