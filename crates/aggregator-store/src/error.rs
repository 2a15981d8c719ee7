//! Error types for the event store.

use rusqlite::ErrorCode;

/// Errors that can occur during event store operations.
///
/// Use [`StoreError::is_transient`] to decide whether an operation is worth
/// retrying. Everything that is not transient is treated as fatal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No pooled connection became available in time.
    #[error("store connection unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    /// A database operation failed.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The schema could not be created or upgraded.
    #[error("store schema initialization failed: {0}")]
    Migration(#[from] aggregator_db::MigrationError),

    /// Persisted state does not have the expected shape.
    #[error("store is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns `true` for failures that may succeed if the operation is
    /// attempted again: lock contention, I/O hiccups, and pool exhaustion.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::CannotOpen
                    | ErrorCode::OperationInterrupted
            ),
            Self::Database(_) | Self::Serialization(_) | Self::Migration(_) | Self::Corrupt(_) => {
                false
            }
        }
    }
}
