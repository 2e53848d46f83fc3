//! Failure taxonomy for one ingestion run.
//!
//! Structural problems (missing columns, missing tables) and strict coercion
//! failures are raised as [`IngestError`] so callers and tests can match on
//! them. Transport and I/O failures stay as `anyhow` errors with context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing required column(s) after normalization: {}", .columns.join(", "))]
    MissingColumns { columns: Vec<String> },

    #[error("column '{column}', row {row}: cannot coerce {value:?} ({reason})")]
    Coercion {
        column: String,
        row: usize,
        value: String,
        reason: String,
    },

    #[error("destination table {table} does not exist (run with --ensure-schema to create it)")]
    MissingTable { table: String },

    #[error(
        "destination table {table} lacks column(s) {} (run with --ensure-schema to add them)",
        .columns.join(", ")
    )]
    TableIncomplete { table: String, columns: Vec<String> },

    #[error("sheet {requested} not found; available sheets: {}", .available.join(", "))]
    SheetNotFound {
        requested: String,
        available: Vec<String>,
    },

    #[error("{0}")]
    InvalidOption(String),
}
