//! Normalizer - turns heterogeneous spreadsheet exports into one per-entity
//! time series.
//!
//! Pipeline:
//! - Read each manifest source (xls/xlsx/ods/csv) into a `Workbook`
//! - Locate the sheet and header row
//! - Map rows through alias tables and coerce cells into canonical records
//! - Merge all records into the `Aggregate` with deterministic conflict rules
//! - Check the aggregate and render it as JSON
//!
//! Same manifest + same files = same output bytes.

pub mod check;
pub mod coerce;
pub mod config;
pub mod entity;
pub mod error;
pub mod extract;
pub mod inspect;
pub mod locator;
pub mod mapper;
pub mod merge;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod workbook;

pub use check::{check, Finding, FindingKind, Severity};
pub use config::{CheckConfig, Manifest, Settings};
pub use entity::{normalize, EntityKey};
pub use error::{CellError, IngestError, PipelineError};
pub use merge::{merge, merge_with_stats, MergeStats};
pub use model::{Aggregate, CanonicalRecord, Reading, TimeSeries};
pub use pipeline::{build, run, RunOptions};
