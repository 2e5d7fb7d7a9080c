//! Value codecs and the sensor format-descriptor mini-language.
//!
//! A [`FormatDescriptor`] is parsed once from its on-disk string (the value
//! most recently written to a sensor's `format_<name>` sub-store) and then
//! used to `pack`/`unpack` every sample. The descriptor alphabet and variant
//! contracts mirror `original_source/src/lmdb_sensor_storage/db/packer.py`
//! and the dispatch in `db/sensor_db.py::Sensor.data_format`.

use crate::error::{Result, StoreError};
use byteorder::{ByteOrder, LittleEndian, NativeEndian};
use serde_json::Value as JsonValue;
use std::convert::TryFrom;
use std::fmt;

/// A value flowing through a codec, typed loosely enough to cover every
/// variant below. Callers that already know their sensor's format can match
/// directly on the variant they expect.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    Str(String),
    Float(f32),
    Int(i16),
    Packed(Vec<PackedScalar>),
    Json(JsonValue),
    Yaml(serde_yaml::Value),
}

/// One field of a [`PackedLayout`], decoded to its native width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PackedScalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl PackedScalar {
    pub fn as_f64(&self) -> f64 {
        match *self {
            PackedScalar::I8(v) => v as f64,
            PackedScalar::U8(v) => v as f64,
            PackedScalar::I16(v) => v as f64,
            PackedScalar::U16(v) => v as f64,
            PackedScalar::I32(v) => v as f64,
            PackedScalar::U32(v) => v as f64,
            PackedScalar::I64(v) => v as f64,
            PackedScalar::U64(v) => v as f64,
            PackedScalar::F32(v) => v as f64,
            PackedScalar::F64(v) => v,
        }
    }
}

/// One character of the packed-format alphabet `{b,B,h,H,i,I,q,Q,f,d}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedFieldKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl PackedFieldKind {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'b' => PackedFieldKind::I8,
            'B' => PackedFieldKind::U8,
            'h' => PackedFieldKind::I16,
            'H' => PackedFieldKind::U16,
            'i' => PackedFieldKind::I32,
            'I' => PackedFieldKind::U32,
            'q' => PackedFieldKind::I64,
            'Q' => PackedFieldKind::U64,
            'f' => PackedFieldKind::F32,
            'd' => PackedFieldKind::F64,
            _ => return None,
        })
    }

    fn to_char(self) -> char {
        match self {
            PackedFieldKind::I8 => 'b',
            PackedFieldKind::U8 => 'B',
            PackedFieldKind::I16 => 'h',
            PackedFieldKind::U16 => 'H',
            PackedFieldKind::I32 => 'i',
            PackedFieldKind::U32 => 'I',
            PackedFieldKind::I64 => 'q',
            PackedFieldKind::U64 => 'Q',
            PackedFieldKind::F32 => 'f',
            PackedFieldKind::F64 => 'd',
        }
    }

    fn width(self) -> usize {
        match self {
            PackedFieldKind::I8 | PackedFieldKind::U8 => 1,
            PackedFieldKind::I16 | PackedFieldKind::U16 => 2,
            PackedFieldKind::I32 | PackedFieldKind::U32 | PackedFieldKind::F32 => 4,
            PackedFieldKind::I64 | PackedFieldKind::U64 | PackedFieldKind::F64 => 8,
        }
    }
}

/// A parsed, fixed-width tuple layout, e.g. `"2f"` or `"HH"`.
///
/// Packed tightly with no padding and always little-endian, a deliberate
/// departure from `struct`'s native alignment — see `SPEC_FULL.md` §9.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedLayout {
    descriptor: String,
    fields: Vec<PackedFieldKind>,
}

impl PackedLayout {
    pub fn fields(&self) -> &[PackedFieldKind] {
        &self.fields
    }

    pub fn len_bytes(&self) -> usize {
        self.fields.iter().map(|f| f.width()).sum()
    }

    /// Parse a struct-style format string: a sequence of `(count?)(char)`
    /// groups drawn from the packed alphabet, e.g. `"3f"`, `"HH"`, `"bId"`.
    fn parse(s: &str) -> Result<Self> {
        let mut fields = Vec::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                let mut digits = String::from(c);
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let count: usize = digits
                    .parse()
                    .map_err(|_| StoreError::invalid(format!("bad repeat count in format '{s}'")))?;
                let kind_char = chars.next().ok_or_else(|| {
                    StoreError::invalid(format!("format '{s}' ends with a dangling repeat count"))
                })?;
                let kind = PackedFieldKind::from_char(kind_char)
                    .ok_or_else(|| StoreError::invalid(format!("unknown format character '{kind_char}' in '{s}'")))?;
                for _ in 0..count {
                    fields.push(kind);
                }
            } else {
                let kind = PackedFieldKind::from_char(c)
                    .ok_or_else(|| StoreError::invalid(format!("unknown format character '{c}' in '{s}'")))?;
                fields.push(kind);
            }
        }
        if fields.is_empty() {
            return Err(StoreError::invalid(format!("format '{s}' describes no fields")));
        }
        Ok(PackedLayout {
            descriptor: s.to_string(),
            fields,
        })
    }

    fn pack(&self, values: &[PackedScalar]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(StoreError::invalid(format!(
                "format '{}' expects {} field(s), got {}",
                self.descriptor,
                self.fields.len(),
                values.len()
            )));
        }
        let mut out = Vec::with_capacity(self.len_bytes());
        for (kind, value) in self.fields.iter().zip(values) {
            push_scalar(&mut out, *kind, *value)?;
        }
        Ok(out)
    }

    fn unpack(&self, bytes: &[u8]) -> Result<Vec<PackedScalar>> {
        if bytes.len() != self.len_bytes() {
            return Err(StoreError::invalid(format!(
                "format '{}' expects {} byte(s), got {}",
                self.descriptor,
                self.len_bytes(),
                bytes.len()
            )));
        }
        let mut out = Vec::with_capacity(self.fields.len());
        let mut offset = 0;
        for kind in &self.fields {
            let width = kind.width();
            out.push(read_scalar(*kind, &bytes[offset..offset + width]));
            offset += width;
        }
        Ok(out)
    }
}

fn push_scalar(out: &mut Vec<u8>, kind: PackedFieldKind, value: PackedScalar) -> Result<()> {
    let mismatch = || StoreError::invalid(format!("value {value:?} does not match field kind '{}'", kind.to_char()));
    match (kind, value) {
        (PackedFieldKind::I8, PackedScalar::I8(v)) => out.push(v as u8),
        (PackedFieldKind::U8, PackedScalar::U8(v)) => out.push(v),
        (PackedFieldKind::I16, PackedScalar::I16(v)) => {
            let mut buf = [0u8; 2];
            LittleEndian::write_i16(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        (PackedFieldKind::U16, PackedScalar::U16(v)) => {
            let mut buf = [0u8; 2];
            LittleEndian::write_u16(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        (PackedFieldKind::I32, PackedScalar::I32(v)) => {
            let mut buf = [0u8; 4];
            LittleEndian::write_i32(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        (PackedFieldKind::U32, PackedScalar::U32(v)) => {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        (PackedFieldKind::I64, PackedScalar::I64(v)) => {
            let mut buf = [0u8; 8];
            LittleEndian::write_i64(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        (PackedFieldKind::U64, PackedScalar::U64(v)) => {
            let mut buf = [0u8; 8];
            LittleEndian::write_u64(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        (PackedFieldKind::F32, PackedScalar::F32(v)) => {
            let mut buf = [0u8; 4];
            LittleEndian::write_f32(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        (PackedFieldKind::F64, PackedScalar::F64(v)) => {
            let mut buf = [0u8; 8];
            LittleEndian::write_f64(&mut buf, v);
            out.extend_from_slice(&buf);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn read_scalar(kind: PackedFieldKind, bytes: &[u8]) -> PackedScalar {
    match kind {
        PackedFieldKind::I8 => PackedScalar::I8(bytes[0] as i8),
        PackedFieldKind::U8 => PackedScalar::U8(bytes[0]),
        PackedFieldKind::I16 => PackedScalar::I16(LittleEndian::read_i16(bytes)),
        PackedFieldKind::U16 => PackedScalar::U16(LittleEndian::read_u16(bytes)),
        PackedFieldKind::I32 => PackedScalar::I32(LittleEndian::read_i32(bytes)),
        PackedFieldKind::U32 => PackedScalar::U32(LittleEndian::read_u32(bytes)),
        PackedFieldKind::I64 => PackedScalar::I64(LittleEndian::read_i64(bytes)),
        PackedFieldKind::U64 => PackedScalar::U64(LittleEndian::read_u64(bytes)),
        PackedFieldKind::F32 => PackedScalar::F32(LittleEndian::read_f32(bytes)),
        PackedFieldKind::F64 => PackedScalar::F64(LittleEndian::read_f64(bytes)),
    }
}

/// The parsed form of a sensor's format-descriptor string.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatDescriptor {
    Bytes,
    Str,
    Float,
    /// Legacy 2-byte signed integer, descriptor string `"h"`.
    Int,
    Packed(PackedLayout),
    Json,
    Yaml,
    Regex,
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_descriptor_string())
    }
}

impl FormatDescriptor {
    pub fn to_descriptor_string(&self) -> String {
        match self {
            FormatDescriptor::Bytes => "bytes".to_string(),
            FormatDescriptor::Str => "str".to_string(),
            FormatDescriptor::Float => "f".to_string(),
            FormatDescriptor::Int => "h".to_string(),
            FormatDescriptor::Json => "json".to_string(),
            FormatDescriptor::Yaml => "yaml".to_string(),
            FormatDescriptor::Regex => "regex".to_string(),
            FormatDescriptor::Packed(layout) => layout.descriptor.clone(),
        }
    }

    pub fn pack(&self, value: &Value) -> Result<Vec<u8>> {
        match (self, value) {
            (FormatDescriptor::Bytes, Value::Bytes(b)) => Ok(b.clone()),
            (FormatDescriptor::Bytes, other) => Ok(coerce_text(other).into_bytes()),
            (FormatDescriptor::Str, other) => Ok(coerce_text(other).into_bytes()),
            (FormatDescriptor::Regex, other) => {
                let pattern = coerce_text(other);
                regex::Regex::new(&pattern)
                    .map_err(|e| StoreError::invalid(format!("invalid regex '{pattern}': {e}")))?;
                Ok(pattern.into_bytes())
            }
            (FormatDescriptor::Float, other) => {
                let f = coerce_f32(other)?;
                let mut buf = [0u8; 4];
                NativeEndian::write_f32(&mut buf, f);
                Ok(buf.to_vec())
            }
            (FormatDescriptor::Int, other) => {
                let i = coerce_i64(other)?;
                let i16v = i16::try_from(i)
                    .map_err(|_| StoreError::invalid(format!("{i} does not fit in a signed 16-bit integer")))?;
                let mut buf = [0u8; 2];
                LittleEndian::write_i16(&mut buf, i16v);
                Ok(buf.to_vec())
            }
            (FormatDescriptor::Packed(layout), Value::Packed(values)) => layout.pack(values),
            (FormatDescriptor::Packed(_), _) => {
                Err(StoreError::invalid("packed format requires an iterable of matching arity"))
            }
            (FormatDescriptor::Json, value) => pack_json(value),
            (FormatDescriptor::Yaml, value) => pack_yaml(value),
        }
    }

    pub fn unpack(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            FormatDescriptor::Bytes => Ok(Value::Bytes(bytes.to_vec())),
            FormatDescriptor::Str | FormatDescriptor::Regex => std::str::from_utf8(bytes)
                .map(|s| Value::Str(s.to_string()))
                .map_err(|e| StoreError::decode("value", e)),
            FormatDescriptor::Float => {
                if bytes.len() != 4 {
                    return Err(StoreError::decode(
                        "value",
                        anyhow::anyhow!("expected 4 bytes for a float, got {}", bytes.len()),
                    ));
                }
                Ok(Value::Float(NativeEndian::read_f32(bytes)))
            }
            FormatDescriptor::Int => {
                if bytes.len() != 2 {
                    return Err(StoreError::decode(
                        "value",
                        anyhow::anyhow!("expected 2 bytes for an int, got {}", bytes.len()),
                    ));
                }
                Ok(Value::Int(LittleEndian::read_i16(bytes)))
            }
            FormatDescriptor::Packed(layout) => layout
                .unpack(bytes)
                .map(Value::Packed)
                .map_err(|e| StoreError::decode("value", anyhow::anyhow!(e.to_string()))),
            FormatDescriptor::Json => std::str::from_utf8(bytes)
                .map_err(|e| StoreError::decode("value", e))
                .and_then(|s| serde_json::from_str(s).map_err(|e| StoreError::decode("value", e)))
                .map(Value::Json),
            FormatDescriptor::Yaml => std::str::from_utf8(bytes)
                .map_err(|e| StoreError::decode("value", e))
                .and_then(|s| serde_yaml::from_str(s).map_err(|e| StoreError::decode("value", e)))
                .map(Value::Yaml),
        }
    }
}

impl TryFrom<&str> for FormatDescriptor {
    type Error = StoreError;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "bytes" => Ok(FormatDescriptor::Bytes),
            "str" => Ok(FormatDescriptor::Str),
            "f" => Ok(FormatDescriptor::Float),
            "h" => Ok(FormatDescriptor::Int),
            "H" => Err(StoreError::invalid(
                "format 'H' (legacy unsigned int) is not supported; re-encode as 'h'",
            )),
            "json" => Ok(FormatDescriptor::Json),
            "yaml" => Ok(FormatDescriptor::Yaml),
            "regex" => Ok(FormatDescriptor::Regex),
            other => PackedLayout::parse(other).map(FormatDescriptor::Packed),
        }
    }
}

fn coerce_text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::Float(f) => f.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Packed(values) => format!(
            "({})",
            values.iter().map(|v| v.as_f64().to_string()).collect::<Vec<_>>().join(", ")
        ),
        Value::Json(j) => j.to_string(),
        Value::Yaml(y) => serde_yaml::to_string(y).unwrap_or_default(),
    }
}

fn coerce_f32(value: &Value) -> Result<f32> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f32),
        Value::Str(s) => s
            .trim()
            .parse::<f32>()
            .map_err(|_| StoreError::invalid(format!("'{s}' is not a number"))),
        Value::Bytes(b) => std::str::from_utf8(b)
            .ok()
            .and_then(|s| s.trim().parse::<f32>().ok())
            .ok_or_else(|| StoreError::invalid("bytes value is not a number")),
        Value::Json(JsonValue::Number(n)) => n
            .as_f64()
            .map(|f| f as f32)
            .ok_or_else(|| StoreError::invalid("JSON number out of range")),
        other => Err(StoreError::invalid(format!("{other:?} cannot be coerced to a float"))),
    }
}

fn coerce_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(*i as i64),
        Value::Float(f) => Ok(*f as i64),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| StoreError::invalid(format!("'{s}' is not an integer"))),
        other => Err(StoreError::invalid(format!("{other:?} cannot be coerced to an integer"))),
    }
}

fn pack_json(value: &Value) -> Result<Vec<u8>> {
    let canonical: JsonValue = match value {
        Value::Json(j) => j.clone(),
        Value::Str(s) => serde_json::from_str(s).map_err(|_| StoreError::invalid(format!("'{s}' is not valid JSON")))?,
        Value::Bytes(b) => {
            let s = std::str::from_utf8(b).map_err(|e| StoreError::invalid(e.to_string()))?;
            serde_json::from_str(s).map_err(|_| StoreError::invalid("bytes value is not valid JSON"))?
        }
        Value::Float(f) => JsonValue::from(*f),
        Value::Int(i) => JsonValue::from(*i),
        Value::Packed(values) => {
            JsonValue::Array(values.iter().map(|v| JsonValue::from(v.as_f64())).collect())
        }
        Value::Yaml(y) => serde_json::to_value(y).map_err(|e| StoreError::invalid(e.to_string()))?,
    };
    Ok(serde_json::to_vec(&canonical).expect("JsonValue always serializes"))
}

fn pack_yaml(value: &Value) -> Result<Vec<u8>> {
    let canonical: serde_yaml::Value = match value {
        Value::Yaml(y) => y.clone(),
        Value::Str(s) => serde_yaml::from_str(s).map_err(|_| StoreError::invalid(format!("'{s}' is not valid YAML")))?,
        Value::Bytes(b) => {
            let s = std::str::from_utf8(b).map_err(|e| StoreError::invalid(e.to_string()))?;
            serde_yaml::from_str(s).map_err(|_| StoreError::invalid("bytes value is not valid YAML"))?
        }
        Value::Float(f) => serde_yaml::Value::from(*f as f64),
        Value::Int(i) => serde_yaml::Value::from(*i as i64),
        Value::Json(j) => serde_json::from_value(j.clone()).map_err(|e| StoreError::invalid(e.to_string()))?,
        Value::Packed(values) => {
            serde_yaml::Value::Sequence(values.iter().map(|v| serde_yaml::Value::from(v.as_f64())).collect())
        }
    };
    serde_yaml::to_string(&canonical)
        .map(|s| s.into_bytes())
        .map_err(|e| StoreError::invalid(e.to_string()))
}

/// Guess a format descriptor for a value that has never been written before,
/// per the first-write fallback algorithm.
pub fn guess_format(value: &Value) -> FormatDescriptor {
    match value {
        Value::Float(_) | Value::Int(_) => FormatDescriptor::Float,
        Value::Json(JsonValue::Number(_)) => FormatDescriptor::Float,
        Value::Json(JsonValue::Object(_)) => FormatDescriptor::Json,
        Value::Yaml(serde_yaml::Value::Mapping(_)) => FormatDescriptor::Json,
        Value::Str(s) => {
            if s.trim().parse::<f64>().is_ok() {
                FormatDescriptor::Float
            } else {
                FormatDescriptor::Str
            }
        }
        Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) if s.trim().parse::<f64>().is_ok() => FormatDescriptor::Float,
            _ => FormatDescriptor::Bytes,
        },
        Value::Packed(values) if !values.is_empty() => {
            FormatDescriptor::Packed(
                PackedLayout::parse(&format!("{}f", values.len())).expect("generated format string is always valid"),
            )
        }
        _ => FormatDescriptor::Json,
    }
}
