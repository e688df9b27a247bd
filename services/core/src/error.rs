use std::io;

use thiserror::Error;

/// A row whose fields could not be coerced into an observation.
///
/// Recovered per row: the row is skipped and the run continues.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: invalid {field} '{value}': {reason}")]
pub struct ParseError {
    pub line: usize,
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

/// A locator that none of the lookup tables could resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnknownReference {
    #[error("unknown country '{0}'")]
    UnknownCountry(String),
    #[error("unknown numeric country code '{0}'")]
    UnknownNumericCode(String),
}

impl UnknownReference {
    /// The raw locator as it appeared in the source.
    pub fn name(&self) -> &str {
        match self {
            Self::UnknownCountry(name) | Self::UnknownNumericCode(name) => name,
        }
    }
}

/// Database settings that cannot be turned into connection options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a port number: '{value}'")]
    InvalidPort { var: &'static str, value: String },
    #[error("DB_URL is not a valid Postgres URL: {0}")]
    InvalidUrl(#[source] sqlx::Error),
}

/// Failure talking to the chart table. Fatal to the current run.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no batch is open")]
    NoOpenBatch,
    #[error("a batch is already open")]
    BatchAlreadyOpen,
    #[error("row {0} not found")]
    MissingRow(i32),
    #[error("{0}")]
    Backend(String),
}

/// A lookup table file that could not be loaded.
#[derive(Debug, Error)]
pub enum ReferenceDataError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("reference table '{table}': {source}")]
    Csv {
        table: String,
        #[source]
        source: csv::Error,
    },
    #[error("reference table '{table}' line {line}: {reason}")]
    Invalid {
        table: String,
        line: usize,
        reason: String,
    },
}

/// Aborted ingestion, with the progress that survived.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(
        "batch {batch} failed after {committed_batches} committed batch(es) ({committed_records} records): {source}"
    )]
    BatchFailed {
        batch: usize,
        committed_batches: usize,
        committed_records: usize,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Records that were committed before the failure.
    pub fn committed_records(&self) -> usize {
        match self {
            Self::BatchFailed {
                committed_records, ..
            } => *committed_records,
            Self::Storage(_) => 0,
        }
    }
}
