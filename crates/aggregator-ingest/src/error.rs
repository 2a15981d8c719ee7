//! Error types for the ingestion pipeline.

use aggregator_store::StoreError;

/// Errors surfaced by the ingestion service and its consumer.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The event store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The blocking task running a store operation panicked or was cancelled.
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The queue was closed for shutdown before the whole batch was queued.
    #[error("ingestion queue closed after accepting {accepted} event(s)")]
    QueueClosed {
        /// Events from the batch that were queued before the close.
        accepted: usize,
    },
}

impl IngestError {
    /// Returns `true` when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Join(_) | Self::QueueClosed { .. } => false,
        }
    }
}
