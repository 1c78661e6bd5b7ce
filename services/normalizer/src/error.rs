use thiserror::Error;

/// Per-source ingestion failure. Recorded as a diagnostic; never aborts the run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no sheet/header row matched in '{source_id}': {detail}")]
    SchemaNotFound { source_id: String, detail: String },

    #[error("unknown schema '{schema}' referenced by source '{source_id}'")]
    UnknownSchema { source_id: String, schema: String },

    #[error("no records extracted from '{source_id}' - check column aliases")]
    NoRecords { source_id: String },

    #[error("workbook error: {0}")]
    Open(#[from] calamine::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-cell coercion failure. Turned into an explanatory note on the record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("unparseable: {raw}")]
    Unparseable { raw: String },
}

/// Run-level failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("zero sources ingested ({failed} failed, {disabled} disabled)")]
    ZeroSourcesIngested { failed: usize, disabled: usize },
}
