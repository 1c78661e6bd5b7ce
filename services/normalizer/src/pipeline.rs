//! Pipeline Runner
//!
//! manifest -> (read -> locate -> map -> extract) per source -> merge -> check
//!
//! Sources are ingested in parallel on the blocking pool; results are merged
//! sequentially in manifest order. A failed source is reported and skipped.
//! Output is DETERMINISTIC: same inputs = same bytes.

use crate::check::{check, Severity};
use crate::config::{Manifest, SchemaConfig, SourceEntry, SourceFormat, YearNote};
use crate::error::{IngestError, PipelineError};
use crate::extract::{derive, extract_records, extract_year, rollup, ExtractContext};
use crate::locator::{locate, locate_all};
use crate::mapper::{RowOutcome, SchemaMapper};
use crate::merge::{merge, merge_with_stats};
use crate::model::{Aggregate, CanonicalRecord, Provenance, Reading};
use crate::output::{to_json, RunReport, SourceReport, SourceStatus};
use crate::workbook::{Cell, Workbook};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Records and diagnostics of one ingested source.
#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub report: SourceReport,
    pub records: Vec<CanonicalRecord>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub aggregate: Aggregate,
    pub report: RunReport,
}

/// Fully resolved options of a `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub manifest: PathBuf,
    pub output: PathBuf,
    pub report: Option<PathBuf>,
    /// Overrides the manifest's `checks.tolerance`.
    pub tolerance: Option<f64>,
    pub jobs: usize,
}

fn format_tag(path: &Path, format: SourceFormat) -> String {
    match format {
        SourceFormat::Csv => "csv".to_string(),
        SourceFormat::Workbook => path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "workbook".to_string()),
    }
}

/// Locate, map and extract an already-read workbook. `path` supplies the
/// file-name year fallback and the location prefix.
pub fn ingest_workbook(
    workbook: &Workbook,
    source: &SourceEntry,
    schema: &SchemaConfig,
    path: &Path,
    format: SourceFormat,
) -> Result<SourceOutcome, IngestError> {
    let hints = source.hints.with_default_markers(schema);
    let located = if hints.all_sheets {
        locate_all(workbook, &hints)?
    } else {
        vec![locate(workbook, &hints)?]
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tag = format_tag(path, format);

    let mut report = SourceReport::new(&source.id, SourceStatus::Ingested);
    if !workbook.content_hash.is_empty() {
        report.content_hash = Some(workbook.content_hash.clone());
    }

    let mut records = Vec::new();
    for found in located {
        let sheet = &workbook.sheets[found.sheet];
        let default_year = source
            .year
            .or_else(|| extract_year(&sheet.name))
            .or_else(|| extract_year(&file_name));

        let mapper = SchemaMapper::new(schema, &sheet.rows[found.header_row], default_year)
            .with_origin(&source.id, &sheet.name);
        if !mapper.missing_columns().is_empty() {
            warn!(
                source = %source.id,
                sheet = %sheet.name,
                missing = ?mapper.missing_columns(),
                "Header row lacks required columns, sheet skipped"
            );
            continue;
        }
        report.sheets.push(sheet.name.clone());

        let ctx = ExtractContext {
            source_id: &source.id,
            source_quality: source.source_quality,
            default_year,
            key_with_code: schema.key_with_code,
            format_tag: &tag,
        };

        for (idx, row) in sheet.rows.iter().enumerate().skip(found.header_row + 1) {
            if row.iter().all(Cell::is_blank) {
                continue;
            }
            let extracted = match mapper.map_row(idx, row) {
                RowOutcome::Record(raw) => extract_records(&raw, &mapper, &ctx),
                RowOutcome::Skipped(reason) => Err(reason),
            };
            match extracted {
                Ok(mut row_records) => {
                    report.rows_mapped += 1;
                    report.unparseable_cells += row_records
                        .iter()
                        .filter(|r| r.note().is_some_and(|n| n.starts_with("unparseable:")))
                        .count();
                    records.append(&mut row_records);
                }
                Err(reason) => {
                    report.rows_skipped += 1;
                    debug!(source = %source.id, sheet = %sheet.name, row = idx + 1, ?reason, "Row skipped");
                }
            }
        }
    }

    let mut records = rollup(records, source.rollup);
    let derived = derive(&records, &schema.derived);
    records.extend(derived);

    if records.is_empty() {
        return Err(IngestError::NoRecords {
            source_id: source.id.clone(),
        });
    }
    report.records = records.len();

    Ok(SourceOutcome { report, records })
}

/// Read one manifest source from disk and ingest it. Blocking.
pub fn ingest_source(manifest: &Manifest, source: &SourceEntry) -> Result<SourceOutcome, IngestError> {
    let schema = manifest
        .schemas
        .get(&source.schema)
        .ok_or_else(|| IngestError::UnknownSchema {
            source_id: source.id.clone(),
            schema: source.schema.clone(),
        })?;

    let path = manifest.resolve_path(source);
    let format = source.format.unwrap_or_else(|| SourceFormat::detect(&path));
    let workbook = Workbook::open(&path, format, &source.id)?;
    ingest_workbook(&workbook, source, schema, &path, format)
}

/// Unavailable records carrying the manifest's year notes, for every entity
/// with observations of the metric both before and after the note year but no
/// record for it. They rank below any real observation.
pub fn year_note_records(aggregate: &Aggregate, notes: &[YearNote]) -> Vec<CanonicalRecord> {
    let mut out = Vec::new();
    for note in notes {
        for (key, entry) in aggregate.entities() {
            let Some(series) = entry.series.get(&note.family) else {
                continue;
            };
            let Some(sample) = series.iter().find(|r| r.metric == note.metric) else {
                continue;
            };
            let years = series.years(&note.metric);
            let inside = years.first().is_some_and(|&first| first < note.year)
                && years.last().is_some_and(|&last| note.year < last);
            if !inside || series.get(&note.metric, note.year).is_some() {
                continue;
            }
            out.push(CanonicalRecord {
                entity_key: key.clone(),
                entity_display_name: entry.display_name.clone(),
                entity_code: key.code().map(str::to_string),
                year: note.year,
                family: note.family.clone(),
                metric: note.metric.clone(),
                reading: Reading::Unavailable(note.note.clone()),
                kind: sample.kind,
                source_quality: i32::MIN,
                provenance: Provenance::new("year_notes", format!("manifest:{}.{}", note.family, note.year)),
            });
        }
    }
    out
}

/// Ingest every enabled source with at most `jobs` in flight, then merge and
/// check. Fails only when no source could be ingested.
pub async fn build(manifest: &Manifest, jobs: usize) -> Result<RunOutcome, PipelineError> {
    let shared = Arc::new(manifest.clone());
    let semaphore = Arc::new(Semaphore::new(jobs.max(1)));

    let mut pending: Vec<(String, Option<JoinHandle<Result<SourceOutcome, IngestError>>>)> = Vec::new();
    for (idx, source) in manifest.sources.iter().enumerate() {
        if !source.enabled {
            info!(source = %source.id, "Source disabled, skipping");
            pending.push((source.id.clone(), None));
            continue;
        }

        // Never closed, so acquisition only fails if the runtime is shutting down.
        let permit = Arc::clone(&semaphore).acquire_owned().await.ok();
        let manifest = Arc::clone(&shared);
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            ingest_source(&manifest, &manifest.sources[idx])
        });
        pending.push((source.id.clone(), Some(handle)));
    }

    let mut aggregate = Aggregate::new();
    let mut sources = Vec::with_capacity(pending.len());
    for (id, handle) in pending {
        let Some(handle) = handle else {
            sources.push(SourceReport::new(id, SourceStatus::Disabled));
            continue;
        };

        let result = match handle.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(join) => Err(format!("ingestion task failed: {join}")),
        };
        match result {
            Ok(outcome) => {
                let (next, stats) = merge_with_stats(&aggregate, outcome.records);
                info!(
                    source = %id,
                    rows = outcome.report.rows_mapped,
                    skipped = outcome.report.rows_skipped,
                    records = outcome.report.records,
                    inserted = stats.inserted,
                    replaced = stats.replaced,
                    kept = stats.kept,
                    "Source ingested"
                );
                aggregate = next;
                sources.push(outcome.report);
            }
            Err(error) => {
                warn!(source = %id, %error, "Source failed, skipping");
                sources.push(SourceReport::failed(id, error));
            }
        }
    }

    let ingested = sources.iter().filter(|s| s.status == SourceStatus::Ingested).count();
    if ingested == 0 {
        let failed = sources.iter().filter(|s| s.status == SourceStatus::Failed).count();
        return Err(PipelineError::ZeroSourcesIngested {
            failed,
            disabled: sources.len() - failed,
        });
    }

    let notes = year_note_records(&aggregate, &manifest.year_notes);
    if !notes.is_empty() {
        debug!(count = notes.len(), "Applying year notes");
        aggregate = merge(&aggregate, notes);
    }

    let findings = check(&aggregate, &manifest.checks);
    for finding in &findings {
        match finding.severity {
            Severity::Warning => warn!(kind = ?finding.kind, entity = %finding.entity, "{}", finding.message),
            Severity::Info => info!(kind = ?finding.kind, entity = %finding.entity, "{}", finding.message),
        }
    }

    let report = RunReport {
        finished_at: Utc::now(),
        entities: aggregate.len(),
        records: aggregate.record_count(),
        sources,
        findings,
    };
    Ok(RunOutcome { aggregate, report })
}

/// Load the manifest, build the aggregate, and write output (and report).
pub async fn run(options: RunOptions) -> Result<RunReport> {
    let mut manifest = Manifest::load(&options.manifest).await?;
    if let Some(tolerance) = options.tolerance {
        manifest.checks.tolerance = tolerance;
    }
    info!(
        manifest = %options.manifest.display(),
        sources = manifest.sources.len(),
        jobs = options.jobs,
        tolerance = manifest.checks.tolerance,
        "Starting run"
    );

    let outcome = build(&manifest, options.jobs).await?;

    let json = to_json(&outcome.aggregate).context("Failed to render output")?;
    tokio::fs::write(&options.output, json)
        .await
        .with_context(|| format!("Failed to write output {}", options.output.display()))?;

    if let Some(path) = &options.report {
        let mut json = serde_json::to_string_pretty(&outcome.report).context("Failed to render report")?;
        json.push('\n');
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }

    info!(
        entities = outcome.report.entities,
        records = outcome.report.records,
        ingested = outcome.report.ingested(),
        failed = outcome.report.count(SourceStatus::Failed),
        findings = outcome.report.findings.len(),
        output = %options.output.display(),
        "Run complete"
    );
    Ok(outcome.report)
}
