//! Time-Series Merger
//!
//! Folds canonical records into an aggregate. `merge` never mutates its input;
//! the result depends only on the set of records, not their arrival order.
//!
//! Conflict on (entity, metric, year):
//! 1. higher source quality wins
//! 2. equal quality: a value beats an unavailable reading
//! 3. still tied: the smaller provenance stays
//!
//! Readings are never averaged.

use crate::entity::EntityKey;
use crate::model::{Aggregate, CanonicalRecord, EntityEntry, Provenance};
use std::cmp::{Ordering, Reverse};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
    pub kept: usize,
}

fn rank(record: &CanonicalRecord) -> (i32, bool, Reverse<&Provenance>) {
    (
        record.source_quality,
        record.reading.has_value(),
        Reverse(&record.provenance),
    )
}

/// Whether `incoming` takes the slot held by `current`.
fn outranks(incoming: &CanonicalRecord, current: &CanonicalRecord) -> bool {
    rank(incoming).cmp(&rank(current)) == Ordering::Greater
}

pub fn merge(existing: &Aggregate, incoming: impl IntoIterator<Item = CanonicalRecord>) -> Aggregate {
    merge_with_stats(existing, incoming).0
}

pub fn merge_with_stats(
    existing: &Aggregate,
    incoming: impl IntoIterator<Item = CanonicalRecord>,
) -> (Aggregate, MergeStats) {
    let mut next = existing.clone();
    let mut stats = MergeStats::default();
    let mut touched: BTreeSet<EntityKey> = BTreeSet::new();

    for mut record in incoming {
        let key = next
            .registry
            .resolve(&record.entity_display_name, record.entity_code.as_deref());
        record.entity_key = key.clone();

        let entry = next.entities.entry(key.clone()).or_default();
        let series = entry.series.entry(record.family.clone()).or_default();

        match series.get(&record.metric, record.year) {
            None => {
                series.put(record);
                stats.inserted += 1;
            }
            Some(current) if outranks(&record, current) => {
                debug!(
                    entity = %key,
                    metric = %record.metric,
                    year = record.year,
                    winner = %record.provenance.source_id,
                    loser = %current.provenance.source_id,
                    "Merge conflict: replaced"
                );
                series.put(record);
                stats.replaced += 1;
            }
            Some(current) => {
                debug!(
                    entity = %key,
                    metric = %record.metric,
                    year = record.year,
                    winner = %current.provenance.source_id,
                    loser = %record.provenance.source_id,
                    "Merge conflict: kept"
                );
                stats.kept += 1;
            }
        }
        touched.insert(key);
    }

    for key in &touched {
        if let Some(entry) = next.entities.get_mut(key) {
            refresh_display_name(entry);
        }
    }

    (next, stats)
}

/// Newest year, then higher quality, then smaller provenance.
fn refresh_display_name(entry: &mut EntityEntry) {
    let best = entry
        .records()
        .max_by(|a, b| {
            (a.year, a.source_quality, Reverse(&a.provenance))
                .cmp(&(b.year, b.source_quality, Reverse(&b.provenance)))
        })
        .map(|r| r.entity_display_name.clone());
    if let Some(name) = best {
        entry.display_name = name;
    }
}
