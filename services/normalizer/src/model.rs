//! Canonical records, time series and the merged aggregate.

use crate::entity::{EntityKey, EntityRegistry};
use serde::Serialize;
use std::collections::BTreeMap;

/// A numeric observation, or the reason there is none.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Value(f64),
    /// Suppressed, not applicable, unparseable... The note is never empty.
    Unavailable(String),
}

impl Reading {
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            Reading::Unavailable(_) => None,
        }
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            Reading::Value(_) => None,
            Reading::Unavailable(note) => Some(note),
        }
    }

    pub fn has_value(&self) -> bool {
        matches!(self, Reading::Value(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Number,
    /// Expected within [0, 1].
    Fraction,
}

/// Where a record came from, e.g. `cmas-2019` / `xlsx:sheet='ELA':row=14`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Provenance {
    pub source_id: String,
    pub location: String,
}

impl Provenance {
    pub fn new(source_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            location: location.into(),
        }
    }
}

/// One entity's one-year, one-metric observation.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub entity_key: EntityKey,
    pub entity_display_name: String,
    pub entity_code: Option<String>,
    pub year: i32,
    pub family: String,
    pub metric: String,
    pub reading: Reading,
    pub kind: ValueKind,
    pub source_quality: i32,
    pub provenance: Provenance,
}

impl CanonicalRecord {
    pub fn value(&self) -> Option<f64> {
        self.reading.value()
    }

    pub fn note(&self) -> Option<&str> {
        self.reading.note()
    }
}

/// Records of one entity and one metric family, ordered by (year, metric).
/// Holds at most one record per (metric, year).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    records: Vec<CanonicalRecord>,
}

impl TimeSeries {
    fn position(&self, metric: &str, year: i32) -> Result<usize, usize> {
        self.records
            .binary_search_by(|r| (r.year, r.metric.as_str()).cmp(&(year, metric)))
    }

    pub fn get(&self, metric: &str, year: i32) -> Option<&CanonicalRecord> {
        self.position(metric, year).ok().map(|i| &self.records[i])
    }

    /// Insert or replace the record at its (metric, year) slot, keeping order.
    /// Conflict resolution happens before this is called.
    pub(crate) fn put(&mut self, record: CanonicalRecord) {
        match self.position(&record.metric, record.year) {
            Ok(i) => self.records[i] = record,
            Err(i) => self.records.insert(i, record),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Years with a record (value or note) for `metric`, ascending.
    pub fn years(&self, metric: &str) -> Vec<i32> {
        self.records
            .iter()
            .filter(|r| r.metric == metric)
            .map(|r| r.year)
            .collect()
    }

    /// Distinct metric names, sorted.
    pub fn metrics(&self) -> Vec<&str> {
        let mut metrics: Vec<&str> = self.records.iter().map(|r| r.metric.as_str()).collect();
        metrics.sort_unstable();
        metrics.dedup();
        metrics
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityEntry {
    pub display_name: String,
    pub series: BTreeMap<String, TimeSeries>,
}

impl EntityEntry {
    pub fn get(&self, metric: &str, year: i32) -> Option<&CanonicalRecord> {
        self.series.values().find_map(|s| s.get(metric, year))
    }

    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.series.values().flat_map(TimeSeries::iter)
    }
}

/// Entity key -> display name and per-family series. Rebuilt from scratch on
/// every run; only `merge` produces new versions.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub(crate) entities: BTreeMap<EntityKey, EntityEntry>,
    pub(crate) registry: EntityRegistry,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entities(&self) -> impl Iterator<Item = (&EntityKey, &EntityEntry)> {
        self.entities.iter()
    }

    pub fn entity(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entities.get(key)
    }

    /// Find an entity by any spelling of its name. Coded entities match on
    /// the name alone.
    pub fn find(&self, raw_name: &str) -> Option<&EntityEntry> {
        if let Some(entry) = self
            .registry
            .lookup(raw_name, None)
            .and_then(|key| self.entities.get(&key))
        {
            return Some(entry);
        }
        let name = crate::entity::normalize(raw_name);
        self.entities
            .iter()
            .find(|(key, _)| key.name() == name)
            .map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.entities.values().map(|e| e.records().count()).sum()
    }
}

/// Content equality; the registry's spelling history is not part of it.
impl PartialEq for Aggregate {
    fn eq(&self, other: &Self) -> bool {
        self.entities == other.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(metric: &str, year: i32, value: f64) -> CanonicalRecord {
        CanonicalRecord {
            entity_key: EntityKey::new("Academy 20", None),
            entity_display_name: "Academy 20".into(),
            entity_code: None,
            year,
            family: "enrollment_trends".into(),
            metric: metric.into(),
            reading: Reading::Value(value),
            kind: ValueKind::Number,
            source_quality: 1,
            provenance: Provenance::new("test", format!("row={year}")),
        }
    }

    #[test]
    fn test_series_sorted_after_every_insertion() {
        let mut series = TimeSeries::default();
        series.put(record("enrollment", 2021, 3.0));
        series.put(record("enrollment", 2019, 1.0));
        series.put(record("free_lunch", 2019, 9.0));
        series.put(record("enrollment", 2020, 2.0));

        let order: Vec<(i32, &str)> = series.iter().map(|r| (r.year, r.metric.as_str())).collect();
        assert_eq!(
            order,
            vec![(2019, "enrollment"), (2019, "free_lunch"), (2020, "enrollment"), (2021, "enrollment")]
        );
        assert_eq!(series.years("enrollment"), vec![2019, 2020, 2021]);
        assert_eq!(series.metrics(), vec!["enrollment", "free_lunch"]);
    }

    #[test]
    fn test_series_put_replaces_same_slot() {
        let mut series = TimeSeries::default();
        series.put(record("enrollment", 2019, 1.0));
        series.put(record("enrollment", 2019, 5.0));
        assert_eq!(series.len(), 1);
        assert_eq!(series.get("enrollment", 2019).unwrap().value(), Some(5.0));
    }

    #[test]
    fn test_find_by_any_spelling() {
        let mut coded = record("enrollment", 2019, 4.0);
        coded.entity_display_name = "Lincoln Elementary".into();
        coded.entity_code = Some("0123".into());
        let aggregate = crate::merge::merge(&Aggregate::new(), vec![record("enrollment", 2019, 1.0), coded]);

        assert!(aggregate.find("ACADEMY  20").is_some());
        let lincoln = aggregate.find("lincoln elementary").unwrap();
        assert_eq!(lincoln.get("enrollment", 2019).unwrap().value(), Some(4.0));
        assert!(aggregate.find("Academy 2").is_none());
    }

    #[test]
    fn test_reading_accessors() {
        let value = Reading::Value(0.42);
        assert_eq!(value.value(), Some(0.42));
        assert_eq!(value.note(), None);

        let missing = Reading::Unavailable("suppressed".into());
        assert_eq!(missing.value(), None);
        assert_eq!(missing.note(), Some("suppressed"));
        assert!(!missing.has_value());
    }
}
