//! Aggregate rendering and the run report.
//!
//! Output is deterministic: same aggregate = same bytes.

use crate::check::Finding;
use crate::model::{Aggregate, CanonicalRecord, EntityEntry, ValueKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};

/// Largest integer an f64 represents exactly.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Display name -> family -> per-year objects ordered by year.
pub type Document = BTreeMap<String, BTreeMap<String, Vec<Map<String, Value>>>>;

fn json_number(record: &CanonicalRecord) -> Value {
    let Some(value) = record.value() else {
        return Value::Null;
    };
    if record.kind == ValueKind::Number && value.fract() == 0.0 && value.abs() < MAX_EXACT_INT {
        return Value::Number(Number::from(value as i64));
    }
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn render_entry(entry: &EntityEntry) -> BTreeMap<String, Vec<Map<String, Value>>> {
    entry
        .series
        .iter()
        .filter(|(_, series)| !series.is_empty())
        .map(|(family, series)| {
            let mut years: BTreeMap<i32, (Map<String, Value>, Map<String, Value>)> = BTreeMap::new();
            for record in series.iter() {
                let (values, notes) = years.entry(record.year).or_default();
                values.insert(record.metric.clone(), json_number(record));
                if let Some(note) = record.note() {
                    notes.insert(record.metric.clone(), Value::String(note.to_string()));
                }
            }

            let rows = years
                .into_iter()
                .map(|(year, (mut values, notes))| {
                    values.insert("year".to_string(), Value::from(year));
                    if !notes.is_empty() {
                        values.insert("notes".to_string(), Value::Object(notes));
                    }
                    values
                })
                .collect();
            (family.clone(), rows)
        })
        .collect()
}

/// Build the output document. Entities sharing a display name are told apart
/// by their key.
pub fn render(aggregate: &Aggregate) -> Document {
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for (_, entry) in aggregate.entities() {
        *name_counts.entry(entry.display_name.as_str()).or_insert(0) += 1;
    }

    aggregate
        .entities()
        .map(|(key, entry)| {
            let name = if name_counts.get(entry.display_name.as_str()).copied().unwrap_or(0) > 1 {
                format!("{} ({})", entry.display_name, key)
            } else {
                entry.display_name.clone()
            };
            (name, render_entry(entry))
        })
        .collect()
}

/// Pretty-printed JSON with a trailing newline.
pub fn to_json(aggregate: &Aggregate) -> serde_json::Result<String> {
    let mut json = serde_json::to_string_pretty(&render(aggregate))?;
    json.push('\n');
    Ok(json)
}

// =============================================================================
// Run Report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ingested,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub id: String,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub sheets: Vec<String>,
    pub rows_mapped: usize,
    pub rows_skipped: usize,
    pub records: usize,
    pub unparseable_cells: usize,
}

impl SourceReport {
    pub fn new(id: impl Into<String>, status: SourceStatus) -> Self {
        Self {
            id: id.into(),
            status,
            error: None,
            content_hash: None,
            sheets: Vec::new(),
            rows_mapped: 0,
            rows_skipped: 0,
            records: 0,
            unparseable_cells: 0,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(id, SourceStatus::Failed)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub records: usize,
    pub sources: Vec<SourceReport>,
    pub findings: Vec<Finding>,
}

impl RunReport {
    pub fn ingested(&self) -> usize {
        self.count(SourceStatus::Ingested)
    }

    pub fn count(&self, status: SourceStatus) -> usize {
        self.sources.iter().filter(|s| s.status == status).count()
    }
}
