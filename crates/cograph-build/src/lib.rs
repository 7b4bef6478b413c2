use std::path::Path;
use std::time::Duration;

use cograph_config::StorageConfig;
use cograph_store::{SqliteGraphStore, StoreError};
use thiserror::Error;

pub mod cooccur;
pub mod ingest;
pub mod sessionize;

pub use cooccur::{
    AggregateRequest, AggregateResult, CoOccurrenceAggregator, PassRequest, PassResult,
};
pub use ingest::{
    IngestOptions, IngestResult, Ingestor, SkippedRow, WriteCounters, read_interaction_batch,
};
pub use sessionize::{
    ClickEvent, ClickLog, SessionizeOptions, SessionizeReport, Sessionized, read_click_events,
    sessionize,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("ingest aborted after {rows_committed} committed rows: {source}")]
    IngestAborted {
        rows_committed: usize,
        #[source]
        source: StoreError,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub fn open_store(
    workspace: impl AsRef<Path>,
    storage: &StorageConfig,
) -> Result<SqliteGraphStore, BuildError> {
    Ok(SqliteGraphStore::open_with_busy_timeout(
        workspace,
        Duration::from_millis(storage.busy_timeout_ms),
    )?)
}
