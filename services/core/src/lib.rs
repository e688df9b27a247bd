//! Chart Core - Shared building blocks for the tb_chart loaders
//!
//! Responsibilities:
//! - Model the chart record and its natural key
//! - Normalize country names and state geocodes into canonical codes
//! - Reconcile records against storage (insert new keys, update known keys)
//! - Read indicator CSV files into observations
//! - Run the stored-row normalization passes
//! - Summarize every run for the console
//!
//! Storage is reached only through the traits in [`store`], so every piece
//! above runs against Postgres or the in-memory store alike.

pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod normalize;
pub mod passes;
pub mod reconcile;
pub mod report;
pub mod source;
pub mod store;
pub mod telemetry;

pub use error::{ConfigError, IngestError, ParseError, ReferenceDataError, StorageError, UnknownReference};
pub use model::{ChartRecord, NaturalKey, Outcome, StoredRow};
pub use normalize::{Country, Normalizer};
pub use reconcile::Reconciler;
pub use report::RunSummary;
