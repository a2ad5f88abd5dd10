use feedscan_model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An insert hit a row that already exists.
    #[error("Row already exists: {table}/{partition_key}/{row_key}")]
    AlreadyExists {
        table: String,
        partition_key: String,
        row_key: String,
    },

    /// A conditional write carried a stale etag.
    #[error("Version conflict on {table}/{partition_key}/{row_key}")]
    VersionConflict {
        table: String,
        partition_key: String,
        row_key: String,
    },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Message of {size} bytes exceeds the {limit} byte limit and cannot be split further")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Unknown message schema: {name} v{version}")]
    UnknownSchema { name: String, version: u32 },

    #[error("No driver registered for scan type {0}")]
    UnsupportedScanType(String),

    /// Persisted state contradicts what the pipeline expects. Redelivery
    /// keeps failing until the underlying data is fixed.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Errors that are expected to go away on redelivery.
    pub fn is_transient(&self) -> bool {
        match self {
            ScanError::Io(_)
            | ScanError::Http(_)
            | ScanError::AlreadyExists { .. }
            | ScanError::VersionConflict { .. } => true,
            #[cfg(feature = "postgres")]
            ScanError::Database(_) => true,
            _ => false,
        }
    }

    /// Optimistic-concurrency failures: someone else wrote first.
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            ScanError::AlreadyExists { .. } | ScanError::VersionConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
