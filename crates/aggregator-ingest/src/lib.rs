//! Asynchronous ingestion pipeline for the event aggregator.
//!
//! Producers hand batches to [`IngestionService::process_events`], which
//! pushes them onto a bounded FIFO [`queue`]. A single background
//! [`Consumer`] pops events one at a time and persists them through the
//! [`EventStore`](aggregator_store::EventStore), retrying transient failures
//! under a [`RetryPolicy`].
//!
//! ```text
//! producers ──push──▶ EventQueue ──pop──▶ Consumer ──try_insert──▶ EventStore
//!                                                                     │
//! get_events / get_stats ◀────────────────────────────────────────────┘
//! ```
//!
//! There is exactly one consumer per service. Persistence order therefore
//! follows queue order, and the uniqueness check always runs on a single
//! writer path.
//!
//! Shutdown is a drain: [`IngestionService::stop`] closes the queue to new
//! pushes and returns only after every event already queued has been handed
//! to the store.

mod consumer;
mod error;
pub mod queue;
mod retry;
mod service;

pub use consumer::{Consumer, ConsumerHandle, ConsumerMetrics, ConsumerState, MetricsSnapshot};
pub use error::IngestError;
pub use queue::{EventReceiver, EventSender, QueueClosed};
pub use retry::{retry, RetryError, RetryPolicy};
pub use service::{IngestConfig, IngestionService};

use aggregator_store::{EventStore, StoreError};
use std::sync::Arc;

/// Runs a synchronous store operation on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(store: &Arc<dyn EventStore>, op: F) -> Result<T, IngestError>
where
    T: Send + 'static,
    F: FnOnce(&dyn EventStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    let result = tokio::task::spawn_blocking(move || op(store.as_ref())).await?;
    Ok(result?)
}
