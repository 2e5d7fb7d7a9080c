//! A single sensor's four collaborating sub-stores, composed into one view.
//!
//! Grounded on `original_source/db/sensor_db.py::Sensor` (data/meta/format/
//! notes composition, the `unfmt` → `fixed` transition on first write) and
//! `TimestampNotesDB` (note auto-wrapping).

use crate::codec::{guess_format, FormatDescriptor, Value};
use crate::env::EnvManager;
use crate::error::{Result, StoreError};
use crate::ordered_map::OrderedMap;
use crate::timestamp_store::{TimestampStore, What};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

pub const DATA_PREFIX: &str = "data_";
pub const META_PREFIX: &str = "meta_";
pub const FORMAT_PREFIX: &str = "format_";
pub const NOTES_PREFIX: &str = "notes_";

/// `Sensor.data_format`'s state machine (§4.9): a sensor is `Unfmt` until
/// its first write, then permanently `Fixed` unless every `data_`/`format_`
/// entry is deleted.
#[derive(Debug, Clone, PartialEq)]
pub enum DataFormat {
    Unfmt,
    Fixed(FormatDescriptor),
}

/// A note's value: either a bare short message or `{short, long?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Note {
    Short(String),
    Full { short: String, long: Option<String> },
}

impl Note {
    pub fn short(&self) -> &str {
        match self {
            Note::Short(s) => s,
            Note::Full { short, .. } => short,
        }
    }

    pub fn long(&self) -> Option<&str> {
        match self {
            Note::Short(_) => None,
            Note::Full { long, .. } => long.as_deref(),
        }
    }

    fn normalize(value: serde_yaml::Value) -> Result<Note> {
        match value {
            serde_yaml::Value::String(s) => Ok(Note::Short(s)),
            serde_yaml::Value::Mapping(_) => {
                let note: Note = serde_yaml::from_value(value)
                    .map_err(|e| StoreError::invalid(format!("notes mapping must have key 'short': {e}")))?;
                Ok(note)
            }
            other => Err(StoreError::invalid(format!("{other:?} is not a valid note"))),
        }
    }
}

pub struct SensorNotes {
    store: TimestampStore,
}

impl SensorNotes {
    fn new(store: TimestampStore) -> Self {
        SensorNotes { store }
    }

    pub fn add_note(&self, timestamp: DateTime<Utc>, note: Note) -> Result<bool> {
        let yaml = serde_yaml::to_string(&note).map_err(|e| StoreError::invalid(e.to_string()))?;
        self.store.write(timestamp, yaml.as_bytes(), false, None)
    }

    pub fn add_short(&self, timestamp: DateTime<Utc>, short: impl Into<String>) -> Result<bool> {
        self.add_note(timestamp, Note::Short(short.into()))
    }

    pub fn range(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Result<Vec<(DateTime<Utc>, Note)>> {
        let rows = self.store.range(since, until, true, None, What::Items)?;
        rows.into_iter()
            .map(|(t, raw)| {
                let s = std::str::from_utf8(&raw).map_err(|e| StoreError::decode("notes", e))?;
                let yaml: serde_yaml::Value = serde_yaml::from_str(s).map_err(|e| StoreError::decode("notes", e))?;
                Ok((t, Note::normalize(yaml)?))
            })
            .collect()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }
}

#[derive(Clone)]
pub struct Metadata {
    map: OrderedMap,
}

impl Metadata {
    fn new(map: OrderedMap) -> Self {
        Metadata { map }
    }

    pub fn get(&self, key: &str) -> Result<Option<serde_yaml::Value>> {
        match self.map.get(key.as_bytes())? {
            Some(bytes) => {
                let s = std::str::from_utf8(&bytes).map_err(|e| StoreError::decode("metadata", e))?;
                Ok(Some(serde_yaml::from_str(s).map_err(|e| StoreError::decode("metadata", e))?))
            }
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: &serde_yaml::Value) -> Result<()> {
        let yaml = serde_yaml::to_string(value).map_err(|e| StoreError::invalid(e.to_string()))?;
        self.map.put(key.as_bytes(), yaml.as_bytes())
    }

    pub fn as_map(&self) -> Result<std::collections::BTreeMap<String, serde_yaml::Value>> {
        let mut out = std::collections::BTreeMap::new();
        for (k, v) in self.map.items()? {
            let key = String::from_utf8(k).map_err(|e| StoreError::decode("metadata", e))?;
            let s = std::str::from_utf8(&v).map_err(|e| StoreError::decode("metadata", e))?;
            let value: serde_yaml::Value = serde_yaml::from_str(s).map_err(|e| StoreError::decode("metadata", e))?;
            out.insert(key, value);
        }
        Ok(out)
    }

    /// The `field_names` reserved key, used by `ExportEngine` to label
    /// packed-format subfield columns.
    pub fn field_names(&self) -> Result<Option<Vec<String>>> {
        match self.get("field_names")? {
            Some(serde_yaml::Value::Sequence(seq)) => Ok(Some(
                seq.into_iter()
                    .map(|v| match v {
                        serde_yaml::Value::String(s) => Ok(s),
                        other => Err(StoreError::invalid(format!("field_names entries must be strings, got {other:?}"))),
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            Some(_) => Err(StoreError::invalid("field_names must be a sequence")),
            None => Ok(None),
        }
    }
}

pub struct Sensor {
    env: EnvManager,
    name: String,
    data: TimestampStore,
    format_history: TimestampStore,
    metadata: Metadata,
    notes: SensorNotes,
}

impl Sensor {
    /// Open a sensor view. `format_override`, when given, takes precedence
    /// over the format-history sub-store's latest entry.
    pub fn open(env: EnvManager, name: impl Into<String>, format_override: Option<FormatDescriptor>) -> Result<Self> {
        let name = name.into();
        let data = TimestampStore::open(env.clone(), format!("{DATA_PREFIX}{name}"))?;
        let format_history = TimestampStore::open(env.clone(), format!("{FORMAT_PREFIX}{name}"))?;
        let metadata = Metadata::new(OrderedMap::open(env.clone(), format!("{META_PREFIX}{name}"))?);
        let notes = SensorNotes::new(TimestampStore::open(env.clone(), format!("{NOTES_PREFIX}{name}"))?);

        let sensor = Sensor { env, name, data, format_history, metadata, notes };

        if let Some(descriptor) = format_override {
            sensor.set_format(descriptor)?;
        }
        Ok(sensor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn notes(&self) -> &SensorNotes {
        &self.notes
    }

    /// Resolve the sensor's current format: an explicit override always
    /// wins; otherwise the latest entry in format-history; otherwise unfmt.
    pub fn data_format(&self) -> Result<DataFormat> {
        match self.format_history.last_value()? {
            Some(bytes) => {
                let s = std::str::from_utf8(&bytes).map_err(|e| StoreError::decode("format", e))?;
                Ok(DataFormat::Fixed(FormatDescriptor::try_from(s)?))
            }
            None => Ok(DataFormat::Unfmt),
        }
    }

    /// Record an explicit descriptor change, appending to format-history
    /// (§4.9: `fixed(d) -> fixed(d')` only happens this way).
    pub fn set_format(&self, descriptor: FormatDescriptor) -> Result<()> {
        let s = descriptor.to_descriptor_string();
        self.format_history.write(Utc::now(), s.as_bytes(), true, None)?;
        Ok(())
    }

    fn ensure_format(&self, sample: &Value) -> Result<FormatDescriptor> {
        match self.data_format()? {
            DataFormat::Fixed(d) => Ok(d),
            DataFormat::Unfmt => {
                let guessed = guess_format(sample);
                self.set_format(guessed.clone())?;
                Ok(guessed)
            }
        }
    }

    /// `write(t, v, ...)`: guesses a format on first write, then delegates
    /// to the conditional-write policy.
    pub fn write(
        &self,
        t: DateTime<Utc>,
        value: &Value,
        only_if_value_changed: bool,
        max_age: Option<Duration>,
    ) -> Result<bool> {
        let format = self.ensure_format(value)?;
        let packed = format.pack(value)?;
        self.data.write(t, &packed, only_if_value_changed, max_age)
    }

    /// Bulk write: guesses from the first value if still unformatted, then
    /// writes every pair unconditionally in one transaction.
    pub fn write_many(&self, ts: &[DateTime<Utc>], values: &[Value]) -> Result<bool> {
        if ts.len() != values.len() {
            return Err(StoreError::invalid("timestamps and values must have equal length"));
        }
        if values.is_empty() {
            return Ok(true);
        }
        let format = self.ensure_format(&values[0])?;
        let mut pairs = Vec::with_capacity(values.len());
        for (t, v) in ts.iter().zip(values) {
            pairs.push((*t, format.pack(v)?));
        }
        self.data.write_many(&pairs)
    }

    pub fn data(&self) -> &TimestampStore {
        &self.data
    }

    pub fn delete_range(&self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Result<bool> {
        self.data.delete_range(since, until)
    }

    pub fn first_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.data.first_timestamp()
    }

    pub fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        self.data.last_timestamp()
    }

    pub fn last_changed(&self) -> Result<Option<DateTime<Utc>>> {
        self.data.last_changed()
    }

    pub fn statistics(&self) -> Result<crate::timestamp_store::Statistics> {
        self.data.statistics()
    }

    /// Copy all four sub-stores to `new_name` (optionally in a different
    /// file). Fails if ANY of the four destinations already exists.
    pub fn copy_to(&self, new_name: &str, target_env: Option<&EnvManager>) -> Result<Sensor> {
        let dest_env = target_env.cloned().unwrap_or_else(|| self.env.clone());
        for prefix in [DATA_PREFIX, META_PREFIX, FORMAT_PREFIX, NOTES_PREFIX] {
            if dest_env.exists(&format!("{prefix}{new_name}"))? {
                return Err(StoreError::AlreadyExists(format!("{prefix}{new_name}")));
            }
        }

        let data_map = OrderedMap::open(self.env.clone(), format!("{DATA_PREFIX}{}", self.name))?;
        data_map.copy_to(&format!("{DATA_PREFIX}{new_name}"), Some(&dest_env))?;
        let meta_map = OrderedMap::open(self.env.clone(), format!("{META_PREFIX}{}", self.name))?;
        meta_map.copy_to(&format!("{META_PREFIX}{new_name}"), Some(&dest_env))?;
        let format_map = OrderedMap::open(self.env.clone(), format!("{FORMAT_PREFIX}{}", self.name))?;
        format_map.copy_to(&format!("{FORMAT_PREFIX}{new_name}"), Some(&dest_env))?;
        let notes_map = OrderedMap::open(self.env.clone(), format!("{NOTES_PREFIX}{}", self.name))?;
        notes_map.copy_to(&format!("{NOTES_PREFIX}{new_name}"), Some(&dest_env))?;

        Sensor::open(dest_env, new_name, None)
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
    fn first_write_guesses_float_format() {
        let (_dir, env) = test_env();
        let sensor = Sensor::open(env, "temp", None).unwrap();
        assert_eq!(sensor.data_format().unwrap(), DataFormat::Unfmt);
        sensor.write(Utc::now(), &Value::Float(21.5), false, None).unwrap();
        assert_eq!(sensor.data_format().unwrap(), DataFormat::Fixed(FormatDescriptor::Float));
    }

    #[test]
    fn explicit_format_override_wins() {
        let (_dir, env) = test_env();
        let sensor = Sensor::open(env, "temp", Some(FormatDescriptor::Str)).unwrap();
        assert_eq!(sensor.data_format().unwrap(), DataFormat::Fixed(FormatDescriptor::Str));
    }

    #[test]
    fn notes_auto_wrap_bare_strings() {
        let (_dir, env) = test_env();
        let sensor = Sensor::open(env, "temp", None).unwrap();
        sensor.notes().add_short(Utc::now(), "calibrated").unwrap();
        let notes = sensor.notes().range(None, None).unwrap();
        assert_eq!(notes[0].1.short(), "calibrated");
        assert_eq!(notes[0].1.long(), None);
    }

    #[test]
    fn copy_to_fails_when_destination_already_exists() {
        let (_dir, env) = test_env();
        let sensor = Sensor::open(env.clone(), "temp", None).unwrap();
        sensor.write(Utc::now(), &Value::Float(1.0), false, None).unwrap();
        Sensor::open(env, "temp2", Some(FormatDescriptor::Float)).unwrap();
        assert!(sensor.copy_to("temp2", None).is_err());
    }

    #[test]
    fn copy_to_duplicates_data_and_metadata() {
        let (_dir, env) = test_env();
        let sensor = Sensor::open(env, "temp", None).unwrap();
        sensor.write(Utc::now(), &Value::Float(1.0), false, None).unwrap();
        sensor
            .metadata()
            .set("label", &serde_yaml::Value::String("Air temp".to_string()))
            .unwrap();
        let copy = sensor.copy_to("temp_copy", None).unwrap();
        assert_eq!(copy.data().len().unwrap(), 1);
        assert_eq!(
            copy.metadata().get("label").unwrap(),
            Some(serde_yaml::Value::String("Air temp".to_string()))
        );
    }
}
