//! Multi-sensor aligned export and the unaligned Node-RED series export.
//!
//! Grounded on `original_source/db/sensor_db.py::LMDBSensorStorage.get_csv`
//! /`get_json`/`get_node_red_graph_data`. The engine never materializes the
//! export in memory beyond the merged timestamp axis; everything else is
//! written straight through the caller's sink, the same plain
//! `std::io::Write` preference `sapflux-core/src/outputs.rs` uses over
//! buffering a whole response.

use crate::codec::{FormatDescriptor, Value};
use crate::error::{Result, StoreError};
use crate::sensor::{DataFormat, Note, Sensor};
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeSet;
use std::io::Write;

/// since/until/limit bounds shared by every export entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timespan {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub endpoint: bool,
    pub limit: Option<usize>,
}

pub struct ExportEngine;

impl ExportEngine {
    /// Sorted union of sample timestamps across `sensors` within `span`.
    fn merged_axis(sensors: &[&Sensor], span: Timespan) -> Result<Vec<DateTime<Utc>>> {
        let mut axis = BTreeSet::new();
        for sensor in sensors {
            for (t, _) in sensor
                .data()
                .range(span.since, span.until, span.endpoint, span.limit, crate::timestamp_store::What::Keys)?
            {
                axis.insert(t);
            }
        }
        Ok(axis.into_iter().collect())
    }

    fn decode_aligned(sensor: &Sensor, axis: &[DateTime<Utc>], span: Timespan) -> Result<(FormatDescriptor, Vec<Option<Value>>)> {
        let format = match sensor.data_format()? {
            DataFormat::Fixed(d) => d,
            DataFormat::Unfmt => FormatDescriptor::Bytes,
        };
        let rows = sensor.data().at(axis, span.since, span.until, span.endpoint, false)?;
        let by_time: std::collections::HashMap<DateTime<Utc>, Vec<u8>> = rows.into_iter().collect();
        let values = axis
            .iter()
            .map(|t| match by_time.get(t) {
                Some(raw) => format.unpack(raw).map(Some),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((format, values))
    }

    fn column_labels(sensor_name: &str, sensor: &Sensor, format: &FormatDescriptor) -> Result<Vec<String>> {
        match format {
            FormatDescriptor::Packed(layout) => {
                let arity = layout.fields().len();
                let field_names = sensor.metadata().field_names()?;
                match field_names {
                    Some(names) if names.len() == arity => {
                        Ok(names.into_iter().map(|n| format!("{sensor_name} {n}")).collect())
                    }
                    _ => Ok((0..arity).map(|i| format!("{sensor_name} Field {i}")).collect()),
                }
            }
            _ => Ok(vec![sensor_name.to_string()]),
        }
    }

    fn value_fields(value: &Option<Value>) -> Vec<String> {
        match value {
            None => vec![String::new()],
            Some(Value::Packed(fields)) => fields.iter().map(|f| format_scalar(*f)).collect(),
            Some(v) => vec![format_value(v)],
        }
    }

    /// `<iso8601>;<v1>;<v2>;...\n` rows; packed sensors expand to one column
    /// per subfield. `include_header` writes a `;`-joined, double-quoted
    /// header row first.
    pub fn write_csv<W: Write>(
        sinks_sensors: &[(&str, &Sensor)],
        sink: &mut W,
        include_header: bool,
        span: Timespan,
    ) -> Result<()> {
        let sensors: Vec<&Sensor> = sinks_sensors.iter().map(|(_, s)| *s).collect();
        let axis = Self::merged_axis(&sensors, span)?;

        let mut decoded = Vec::with_capacity(sinks_sensors.len());
        for (name, sensor) in sinks_sensors {
            let (format, values) = Self::decode_aligned(sensor, &axis, span)?;
            decoded.push((*name, *sensor, format, values));
        }

        if include_header {
            let mut header = vec!["\"Time\"".to_string()];
            for (name, sensor, format, _) in &decoded {
                for label in Self::column_labels(name, sensor, format)? {
                    header.push(format!("\"{label}\""));
                }
            }
            writeln!(sink, "{}", header.join(";")).map_err(io_err)?;
        }

        for (idx, t) in axis.iter().enumerate() {
            let mut row = vec![crate::time::format_timestamp(*t)];
            for (_, _, _, values) in &decoded {
                row.extend(Self::value_fields(&values[idx]));
            }
            writeln!(sink, "{}", row.join(";")).map_err(io_err)?;
        }
        Ok(())
    }

    /// `{"Time":[...], "<sensor>":{"values":[...], "metadata":{...}?,
    /// "notes":[...]? }, ...}`, written field-by-field through the sink.
    pub fn write_json<W: Write>(sinks_sensors: &[(&str, &Sensor)], sink: &mut W, span: Timespan) -> Result<()> {
        let sensors: Vec<&Sensor> = sinks_sensors.iter().map(|(_, s)| *s).collect();
        let axis = Self::merged_axis(&sensors, span)?;

        write!(sink, "{{\"Time\":").map_err(io_err)?;
        let time_json: Vec<String> = axis.iter().map(|t| crate::time::format_timestamp(*t)).collect();
        serde_json::to_writer(&mut *sink, &time_json).map_err(json_err)?;

        for (name, sensor) in sinks_sensors {
            let (_, values) = Self::decode_aligned(sensor, &axis, span)?;
            let values_json: Vec<JsonValue> = values.iter().map(value_to_json).collect();

            write!(sink, ",\"{name}\":{{\"values\":").map_err(io_err)?;
            serde_json::to_writer(&mut *sink, &values_json).map_err(json_err)?;

            let meta = sensor.metadata().as_map()?;
            if !meta.is_empty() {
                let meta_json: std::collections::BTreeMap<String, JsonValue> = meta
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::to_value(v).unwrap_or(JsonValue::Null)))
                    .collect();
                write!(sink, ",\"metadata\":").map_err(io_err)?;
                serde_json::to_writer(&mut *sink, &meta_json).map_err(json_err)?;
            }

            let notes = sensor.notes().range(span.since, span.until)?;
            if !notes.is_empty() {
                write!(sink, ",\"notes\":[").map_err(io_err)?;
                for (i, (t, note)) in notes.iter().enumerate() {
                    if i > 0 {
                        write!(sink, ",").map_err(io_err)?;
                    }
                    let entry = json!({ crate::time::format_timestamp(*t): note_to_json(note) });
                    serde_json::to_writer(&mut *sink, &entry).map_err(json_err)?;
                }
                write!(sink, "]").map_err(io_err)?;
            }
            write!(sink, "}}").map_err(io_err)?;
        }
        write!(sink, "}}").map_err(io_err)?;
        Ok(())
    }

    /// Un-aligned per-sensor series in Node-RED dashboard chart format:
    /// `{"series": [name], "data": [[{x, y}, ...]], "labels": [""]}`.
    /// Supplements the aligned exports with the original's
    /// `get_node_red_graph_data` shape for a single sensor.
    pub fn write_series_json<W: Write>(sensor_name: &str, sensor: &Sensor, sink: &mut W, span: Timespan) -> Result<()> {
        let format = match sensor.data_format()? {
            DataFormat::Fixed(d) => d,
            DataFormat::Unfmt => FormatDescriptor::Bytes,
        };
        let rows = sensor
            .data()
            .range(span.since, span.until, span.endpoint, span.limit, crate::timestamp_store::What::Items)?;
        let points: Vec<JsonValue> = rows
            .into_iter()
            .map(|(t, raw)| {
                let value = format.unpack(&raw)?;
                Ok(json!({ "x": t.timestamp_millis(), "y": value_to_json(&Some(value)) }))
            })
            .collect::<Result<Vec<_>>>()?;
        let payload = json!({ "series": [sensor_name], "data": [points], "labels": [""] });
        serde_json::to_writer(sink, &payload).map_err(json_err)
    }
}

/// `str(float)` in Python always carries a decimal point (`1.0`, not `1`);
/// `f64::to_string()` drops it for whole numbers, so force one back in.
fn pythonic_float(f: f64) -> String {
    let s = f.to_string();
    if s.contains('.') || s.contains('e') || s.contains('E') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{s}.0")
    }
}

fn format_scalar(s: crate::codec::PackedScalar) -> String {
    use crate::codec::PackedScalar::*;
    match s {
        I8(v) => v.to_string(),
        U8(v) => v.to_string(),
        I16(v) => v.to_string(),
        U16(v) => v.to_string(),
        I32(v) => v.to_string(),
        U32(v) => v.to_string(),
        I64(v) => v.to_string(),
        U64(v) => v.to_string(),
        F32(v) => pythonic_float(v as f64),
        F64(v) => pythonic_float(v),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Str(s) => s.clone(),
        Value::Float(f) => pythonic_float(*f as f64),
        Value::Int(i) => i.to_string(),
        Value::Json(j) => j.to_string(),
        Value::Yaml(y) => serde_yaml::to_string(y).unwrap_or_default(),
        Value::Packed(_) => unreachable!("packed values are expanded field-by-field"),
    }
}

fn value_to_json(value: &Option<Value>) -> JsonValue {
    match value {
        None => JsonValue::Null,
        Some(Value::Bytes(b)) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
        Some(Value::Str(s)) => JsonValue::String(s.clone()),
        Some(Value::Float(f)) => json!(f),
        Some(Value::Int(i)) => json!(i),
        Some(Value::Json(j)) => j.clone(),
        Some(Value::Yaml(y)) => serde_json::to_value(y).unwrap_or(JsonValue::Null),
        Some(Value::Packed(fields)) => JsonValue::Array(fields.iter().map(|f| json!(f.as_f64())).collect()),
    }
}

fn note_to_json(note: &Note) -> JsonValue {
    match note.long() {
        Some(long) => json!({ "short": note.short(), "long": long }),
        None => json!({ "short": note.short() }),
    }
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Io(heed::Error::Io(e))
}

fn json_err(e: serde_json::Error) -> StoreError {
    StoreError::decode("export", e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::env::{EnvManager, EnvManagerOptions};
    use crate::sensor::Sensor;

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
    fn csv_export_locf_fills_gaps() {
        let (_dir, env) = test_env();
        let temp = Sensor::open(env.clone(), "temp", None).unwrap();
        let humidity = Sensor::open(env, "humidity", None).unwrap();
        let t0 = Utc::now();
        temp.write(t0, &Value::Float(10.0), false, None).unwrap();
        humidity.write(t0, &Value::Float(50.0), false, None).unwrap();
        humidity.write(t0 + chrono::Duration::seconds(5), &Value::Float(55.0), false, None).unwrap();

        let mut out = Vec::new();
        ExportEngine::write_csv(&[("temp", &temp), ("humidity", &humidity)], &mut out, true, Timespan::default()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "\"Time\";\"temp\";\"humidity\"");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].ends_with(";10.0;55.0"));
    }

    #[test]
    fn json_export_includes_metadata_when_present() {
        let (_dir, env) = test_env();
        let temp = Sensor::open(env, "temp", None).unwrap();
        temp.write(Utc::now(), &Value::Float(10.0), false, None).unwrap();
        temp.metadata().set("unit", &serde_yaml::Value::String("C".into())).unwrap();

        let mut out = Vec::new();
        ExportEngine::write_json(&[("temp", &temp)], &mut out, Timespan::default()).unwrap();
        let parsed: JsonValue = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["temp"]["metadata"]["unit"], "C");
    }

    #[test]
    fn series_export_is_unaligned_and_uses_epoch_millis() {
        let (_dir, env) = test_env();
        let temp = Sensor::open(env, "temp", None).unwrap();
        let t0 = Utc::now();
        temp.write(t0, &Value::Float(10.0), false, None).unwrap();

        let mut out = Vec::new();
        ExportEngine::write_series_json("temp", &temp, &mut out, Timespan::default()).unwrap();
        let parsed: JsonValue = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["series"][0], "temp");
        assert_eq!(parsed["data"][0][0]["x"], t0.timestamp_millis());
    }
}
