use crate::pipeline::PipelineReport;
use std::path::PathBuf;
use thiserror::Error;

pub type RetailerID = i64;
pub type BranchCount = i32;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open input file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed input: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line} has {found} fields, expected 2")]
    FieldCount { line: u64, found: usize },
    #[error("branch count {value} on line {line} does not fit in 32 bits")]
    BranchCountOutOfRange { line: u64, value: i64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store lock is poisoned")]
    PoisonLock,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("lookup of retailer {retailer_id} failed: {source}")]
    Lookup {
        retailer_id: RetailerID,
        #[source]
        source: StoreError,
    },
    #[error("update of retailer {retailer_id} failed: {source}")]
    Update {
        retailer_id: RetailerID,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Reading stopped early. Records forwarded before the failure were still applied.
    #[error("input stopped after {} records: {source}", .report.received)]
    Input {
        #[source]
        source: SourceError,
        report: PipelineReport,
    },
    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("`{field}` is not a valid SQL identifier: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("database.max_connections must be greater than zero")]
    NoConnections,
    #[error("database.min_connections ({min}) exceeds database.max_connections ({max})")]
    PoolBounds { min: u32, max: u32 },
}
