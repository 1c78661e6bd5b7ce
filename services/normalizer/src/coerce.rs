//! Cell value coercion.
//!
//! A malformed cell never aborts a file: it becomes an unavailable reading
//! with a note explaining why.

use crate::config::Coercion;
use crate::error::CellError;
use crate::model::Reading;
use crate::workbook::{format_number, Cell};
use std::collections::BTreeMap;

/// Values above this are taken to be percent points, not fractions.
pub const PERCENT_POINTS_THRESHOLD: f64 = 1.5;

/// Sentinel token -> explanatory note. Matching is trimmed and case-insensitive.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentinels {
    table: BTreeMap<String, String>,
}

impl Default for Sentinels {
    fn default() -> Self {
        let table = [
            ("*", "suppressed"),
            ("not available", "not available"),
            ("n/a", "not applicable"),
            ("na", "not applicable"),
            ("n", "not reported"),
            ("-", "not reported"),
            ("--", "not reported"),
            ("n<16", "suppressed (fewer than 16 students)"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { table }
    }
}

impl Sentinels {
    /// Field table, else schema table, else the defaults.
    pub fn resolve(
        field: Option<&BTreeMap<String, String>>,
        schema: Option<&BTreeMap<String, String>>,
    ) -> Self {
        match field.or(schema) {
            Some(table) => Self {
                table: table
                    .iter()
                    .map(|(k, v)| (k.trim().to_lowercase(), v.clone()))
                    .collect(),
            },
            None => Self::default(),
        }
    }

    pub fn note_for(&self, raw: &str) -> Option<&str> {
        self.table.get(&raw.trim().to_lowercase()).map(String::as_str)
    }
}

/// Outcome of coercing one cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    /// Blank cell: no observation at all.
    Blank,
    Reading(Reading),
}

pub fn coerce(cell: &Cell, rule: Coercion, sentinels: &Sentinels) -> Coerced {
    let (number, percent_sign) = match cell {
        Cell::Empty => return Coerced::Blank,
        Cell::Number(n) => (*n, false),
        Cell::Text(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return Coerced::Blank;
            }
            if let Some(note) = sentinels.note_for(raw) {
                return Coerced::Reading(Reading::Unavailable(note.to_string()));
            }
            match parse_number(raw) {
                Ok(parsed) => parsed,
                Err(e) => return Coerced::Reading(Reading::Unavailable(e.to_string())),
            }
        }
    };

    if !number.is_finite() {
        let raw = format_number(number);
        return Coerced::Reading(Reading::Unavailable(CellError::Unparseable { raw }.to_string()));
    }

    let value = match rule {
        Coercion::Number => number,
        _ if percent_sign => number / 100.0,
        Coercion::Percent => normalize_percent(number),
        Coercion::Fraction => number,
        Coercion::PercentPoints => number / 100.0,
    };
    Coerced::Reading(Reading::Value(value))
}

/// Fraction for a percentage of unknown representation.
pub fn normalize_percent(value: f64) -> f64 {
    if value > PERCENT_POINTS_THRESHOLD {
        value / 100.0
    } else {
        value
    }
}

/// Parse a numeric cell tolerating `1,234`, `$1,234.50`, `87.3%`.
/// Returns the number and whether a percent sign was present.
pub fn parse_number(raw: &str) -> Result<(f64, bool), CellError> {
    let trimmed = raw.trim();
    let (body, percent_sign) = match trimmed.strip_suffix('%') {
        Some(body) => (body.trim_end(), true),
        None => (trimmed, false),
    };
    let cleaned: String = body.chars().filter(|c| *c != ',' && *c != '$').collect();

    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(|n| (n, percent_sign))
        .ok_or_else(|| CellError::Unparseable {
            raw: trimmed.to_string(),
        })
}
