//! Embedded time-series storage engine for sensor telemetry on top of a
//! memory-mapped, ordered key-value store.
//!
//! [`catalog::SensorCatalog`] is the usual entry point: it opens a file and
//! gives out [`sensor::Sensor`] views, each composed of four sub-stores
//! (data/meta/format/notes). [`export::ExportEngine`] aligns several
//! sensors onto one merged timestamp axis for CSV/JSON export.

pub mod catalog;
pub mod chunker;
pub mod codec;
pub mod env;
pub mod error;
pub mod export;
pub mod ordered_map;
pub mod sensor;
pub mod time;
pub mod timestamp_store;

pub mod prelude {
    pub use crate::catalog::{FileStatistics, PlotGroups, SensorCatalog, SensorStatistics};
    pub use crate::codec::{FormatDescriptor, PackedScalar, Value};
    pub use crate::error::{Result, StoreError};
    pub use crate::export::{ExportEngine, Timespan};
    pub use crate::sensor::{DataFormat, Metadata, Note, Sensor, SensorNotes};
    pub use crate::timestamp_store::{Bucket, TimestampStore, What};
}
