//! Source manifest and process settings.
//!
//! The manifest is a JSON document listing the spreadsheet exports of one data
//! refresh, the column schemas they map onto, and the checks to run on the
//! merged aggregate. Paths inside it are relative to the manifest file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// =============================================================================
// Manifest Types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaConfig>,
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub year_notes: Vec<YearNote>,
    #[serde(default)]
    pub checks: CheckConfig,
    /// Directory the manifest was loaded from; source paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    pub path: PathBuf,
    #[serde(default)]
    pub format: Option<SourceFormat>,
    pub schema: String,
    /// Fixed observation year; otherwise taken from a year column, the sheet
    /// name or the file name.
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default = "default_quality")]
    pub source_quality: i32,
    #[serde(default)]
    pub hints: SheetHints,
    #[serde(default)]
    pub rollup: RollupMode,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_quality() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Workbook,
    Csv,
}

impl SourceFormat {
    /// Infer the format from the file extension. Anything that is not `.csv`
    /// or `.txt` goes through calamine, which sniffs the container itself.
    pub fn detect(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") | Some("txt") => SourceFormat::Csv,
            _ => SourceFormat::Workbook,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupMode {
    #[default]
    None,
    Sum,
    Mean,
}

/// Where to look for the header row inside a workbook.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetHints {
    /// Case-insensitive substrings of candidate sheet names.
    #[serde(default)]
    pub sheet_names: Vec<String>,
    /// Sheets whose name contains one of these are never scanned.
    #[serde(default)]
    pub skip_sheets: Vec<String>,
    /// Tokens that must appear (whole cell, case-insensitive) in the header row.
    #[serde(default)]
    pub header_markers: Vec<String>,
    #[serde(default = "default_scan_rows")]
    pub scan_rows: usize,
    #[serde(default = "default_min_non_empty")]
    pub min_non_empty: usize,
    /// Use every qualifying sheet instead of the first one.
    #[serde(default)]
    pub all_sheets: bool,
}

fn default_scan_rows() -> usize {
    50
}

fn default_min_non_empty() -> usize {
    3
}

impl Default for SheetHints {
    fn default() -> Self {
        Self {
            sheet_names: Vec::new(),
            skip_sheets: Vec::new(),
            header_markers: Vec::new(),
            scan_rows: default_scan_rows(),
            min_non_empty: default_min_non_empty(),
            all_sheets: false,
        }
    }
}

impl SheetHints {
    /// Fall back to the schema's entity aliases when no markers are declared.
    pub fn with_default_markers(&self, schema: &SchemaConfig) -> SheetHints {
        let mut hints = self.clone();
        if hints.header_markers.is_empty() {
            hints.header_markers = schema.entity.aliases.clone();
        }
        hints
    }
}

/// Canonical field schema shared by sources of the same kind.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    pub entity: ColumnSpec,
    #[serde(default)]
    pub entity_code: Option<ColumnSpec>,
    /// Augment entity keys with the external code column.
    #[serde(default)]
    pub key_with_code: bool,
    #[serde(default)]
    pub year: Option<ColumnSpec>,
    pub fields: Vec<FieldSpec>,
    #[serde(default = "default_total_markers")]
    pub total_markers: Vec<String>,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
    #[serde(default)]
    pub derived: Vec<DerivedMetric>,
    /// Sentinel token -> note, for every field of this schema.
    #[serde(default)]
    pub sentinels: Option<BTreeMap<String, String>>,
}

fn default_total_markers() -> Vec<String> {
    vec!["9999".into(), "STATE TOTAL".into(), "TOTAL".into()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub metric: String,
    pub family: String,
    pub aliases: Vec<String>,
    #[serde(default)]
    pub coerce: Coercion,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sentinels: Option<BTreeMap<String, String>>,
    /// Read every standalone year header (`2019`, `2023`, ...) as this field
    /// for that year. Aliases apply only when no such header exists.
    #[serde(default)]
    pub year_columns: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    #[default]
    Number,
    /// Percentage stored either as 0.873 or 87.3; detected by magnitude.
    Percent,
    /// Percentage already stored as a fraction.
    Fraction,
    /// Percentage already stored as percent points.
    PercentPoints,
}

impl Coercion {
    pub fn is_percentage(self) -> bool {
        !matches!(self, Coercion::Number)
    }
}

/// Keep only rows whose column value is one of `equals` (case-insensitive).
#[derive(Debug, Clone, Deserialize)]
pub struct RowFilter {
    pub aliases: Vec<String>,
    pub equals: Vec<String>,
}

/// `metric = sum(numerators) / denominator`, stored as a fraction.
#[derive(Debug, Clone, Deserialize)]
pub struct DerivedMetric {
    pub metric: String,
    pub family: String,
    pub numerators: Vec<String>,
    pub denominator: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YearNote {
    pub family: String,
    pub metric: String,
    pub year: i32,
    pub note: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_complements")]
    pub complements: Vec<ComplementPair>,
    #[serde(default)]
    pub expected_years: Option<YearRange>,
    #[serde(default)]
    pub expected_entities: Vec<String>,
}

pub const DEFAULT_TOLERANCE: f64 = 0.02;

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

fn default_complements() -> Vec<ComplementPair> {
    vec![ComplementPair {
        rate: "attendance_rate".to_string(),
        complement: "chronic_absence_rate".to_string(),
    }]
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            complements: default_complements(),
            expected_years: None,
            expected_entities: Vec::new(),
        }
    }
}

/// Two fraction metrics expected to sum to roughly 1.
#[derive(Debug, Clone, Deserialize)]
pub struct ComplementPair {
    pub rate: String,
    pub complement: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct YearRange {
    pub start: i32,
    pub end: i32,
}

impl Manifest {
    /// Load manifest from a JSON file
    pub async fn load(path: &Path) -> Result<Manifest> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Manifest::from_json(&content, base_dir)
    }

    pub fn from_json(content: &str, base_dir: PathBuf) -> Result<Manifest> {
        let mut manifest: Manifest =
            serde_json::from_str(content).context("Failed to parse manifest")?;
        manifest.base_dir = base_dir;
        Ok(manifest)
    }

    pub fn resolve_path(&self, source: &SourceEntry) -> PathBuf {
        if source.path.is_absolute() {
            source.path.clone()
        } else {
            self.base_dir.join(&source.path)
        }
    }
}

// =============================================================================
// Process Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    pub jobs: usize,
    pub tolerance: Option<f64>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let jobs = match std::env::var("NORMALIZER_JOBS") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("NORMALIZER_JOBS is not a number: {raw}"))?,
            Err(_) => 4,
        };
        let tolerance = match std::env::var("NORMALIZER_TOLERANCE") {
            Ok(raw) => Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("NORMALIZER_TOLERANCE is not a number: {raw}"))?,
            ),
            Err(_) => None,
        };
        Ok(Self { jobs, tolerance })
    }
}
