//! Consistency checks over a merged aggregate. Read-only; findings are
//! reported, never fixed.

use crate::config::{CheckConfig, YearRange};
use crate::model::{Aggregate, EntityEntry, ValueKind};
use serde::Serialize;
use std::collections::BTreeMap;

/// Floating-point slack so a deviation equal to the tolerance is not flagged.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    ArithmeticMismatch,
    MissingYear,
    OutOfRange,
    MissingEntity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub kind: FindingKind,
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub message: String,
}

pub fn check(aggregate: &Aggregate, config: &CheckConfig) -> Vec<Finding> {
    let global = global_year_ranges(aggregate);
    let mut findings = Vec::new();

    for (_, entry) in aggregate.entities() {
        check_complements(entry, config, &mut findings);
        check_coverage(entry, config.expected_years, &global, &mut findings);
        check_ranges(entry, &mut findings);
    }

    for expected in &config.expected_entities {
        if aggregate.find(expected).is_none() {
            findings.push(Finding {
                severity: Severity::Warning,
                kind: FindingKind::MissingEntity,
                entity: expected.clone(),
                metric: None,
                year: None,
                value: None,
                message: format!("expected entity '{expected}' not present in any source"),
            });
        }
    }

    findings
}

/// Rate and complement should sum to 1 within tolerance.
fn check_complements(entry: &EntityEntry, config: &CheckConfig, findings: &mut Vec<Finding>) {
    for pair in &config.complements {
        for rate in entry.records().filter(|r| r.metric == pair.rate) {
            let Some(a) = rate.value() else { continue };
            let Some(c) = entry.get(&pair.complement, rate.year).and_then(|r| r.value()) else {
                continue;
            };
            let deviation = (a - (1.0 - c)).abs();
            if deviation > config.tolerance + EPSILON {
                findings.push(Finding {
                    severity: Severity::Warning,
                    kind: FindingKind::ArithmeticMismatch,
                    entity: entry.display_name.clone(),
                    metric: Some(pair.rate.clone()),
                    year: Some(rate.year),
                    value: Some(a),
                    message: format!(
                        "{} {:.4} + {} {:.4} deviates from 1 by {:.4} (tolerance {})",
                        pair.rate, a, pair.complement, c, deviation, config.tolerance
                    ),
                });
            }
        }
    }
}

/// Min and max observed year per metric across all entities.
fn global_year_ranges(aggregate: &Aggregate) -> BTreeMap<String, YearRange> {
    let mut ranges: BTreeMap<String, YearRange> = BTreeMap::new();
    for (_, entry) in aggregate.entities() {
        for record in entry.records() {
            ranges
                .entry(record.metric.clone())
                .and_modify(|r| {
                    r.start = r.start.min(record.year);
                    r.end = r.end.max(record.year);
                })
                .or_insert(YearRange {
                    start: record.year,
                    end: record.year,
                });
        }
    }
    ranges
}

/// Interior gaps in an entity's series, limited to the expected range.
fn check_coverage(
    entry: &EntityEntry,
    expected: Option<YearRange>,
    global: &BTreeMap<String, YearRange>,
    findings: &mut Vec<Finding>,
) {
    for series in entry.series.values() {
        for metric in series.metrics() {
            let years = series.years(metric);
            let (Some(&first), Some(&last)) = (years.first(), years.last()) else {
                continue;
            };
            let Some(range) = expected.or_else(|| global.get(metric).copied()) else {
                continue;
            };
            for year in (first + 1)..last {
                if year < range.start || year > range.end || years.contains(&year) {
                    continue;
                }
                findings.push(Finding {
                    severity: Severity::Info,
                    kind: FindingKind::MissingYear,
                    entity: entry.display_name.clone(),
                    metric: Some(metric.to_string()),
                    year: Some(year),
                    value: None,
                    message: format!("no {metric} record for {year}"),
                });
            }
        }
    }
}

fn check_ranges(entry: &EntityEntry, findings: &mut Vec<Finding>) {
    for record in entry.records() {
        if record.kind != ValueKind::Fraction {
            continue;
        }
        let Some(value) = record.value() else { continue };
        if value < -EPSILON || value > 1.0 + EPSILON {
            findings.push(Finding {
                severity: Severity::Warning,
                kind: FindingKind::OutOfRange,
                entity: entry.display_name.clone(),
                metric: Some(record.metric.clone()),
                year: Some(record.year),
                value: Some(value),
                message: format!(
                    "{} = {} outside [0, 1] ({})",
                    record.metric, value, record.provenance.source_id
                ),
            });
        }
    }
}
