//! Public entry point that owns the queue and the consumer lifecycle.

use aggregator_store::EventStore;
use aggregator_types::{Event, Stats};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::consumer::{Consumer, ConsumerHandle, ConsumerMetrics, ConsumerState, MetricsSnapshot};
use crate::queue::{self, EventSender, QueueClosed};
use crate::retry::RetryPolicy;
use crate::{run_blocking, IngestError};

/// Tunables for the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Maximum number of queued events before producers wait.
    pub queue_capacity: usize,
    /// Retry policy applied to every store insert.
    pub retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    sender: Option<EventSender>,
    consumer: Option<ConsumerHandle>,
    /// State of a consumer that `stop` has taken out and is draining.
    draining: Option<watch::Receiver<ConsumerState>>,
    stopped: bool,
}

impl Lifecycle {
    /// Forgets a drain that has finished and returns one still in progress.
    fn pending_drain(&mut self) -> Option<watch::Receiver<ConsumerState>> {
        match &self.draining {
            Some(state) if has_exited(state) => {
                self.draining = None;
                self.stopped = self.consumer.is_none();
                None
            }
            other => other.clone(),
        }
    }
}

fn has_exited(state: &watch::Receiver<ConsumerState>) -> bool {
    // A closed channel means the consumer task is gone.
    *state.borrow() == ConsumerState::Stopped || state.has_changed().is_err()
}

async fn wait_exited(mut state: watch::Receiver<ConsumerState>) {
    // Err means the sender was dropped, which also ends the wait.
    let _ = state.wait_for(|s| *s == ConsumerState::Stopped).await;
}

/// Accepts event batches, queues them, and runs the consumer that persists
/// them.
///
/// `process_events` returns as soon as a batch is queued; persistence
/// happens asynchronously and is observable through [`get_stats`].
///
/// [`get_stats`]: IngestionService::get_stats
pub struct IngestionService {
    store: Arc<dyn EventStore>,
    config: IngestConfig,
    metrics: Arc<ConsumerMetrics>,
    lifecycle: Mutex<Lifecycle>,
}

impl IngestionService {
    /// Creates a stopped service over `store`.
    pub fn new(store: Arc<dyn EventStore>, config: IngestConfig) -> Self {
        Self {
            store,
            config,
            metrics: Arc::new(ConsumerMetrics::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Starts the consumer if it is not already running. Idempotent.
    ///
    /// If a `stop` is still draining, waits for it first so that only one
    /// consumer ever writes at a time.
    pub async fn start(&self) {
        self.running_sender().await;
    }

    /// Drains every queued event into the store, then stops the consumer.
    /// Idempotent; concurrent callers all return once the drain is done.
    ///
    /// Completes in time bounded by queue depth times the per-event retry
    /// budget. The lifecycle lock is not held while draining, so
    /// `consumer_state` keeps answering. A later `start` or
    /// `process_events` starts a fresh consumer after the drain.
    pub async fn stop(&self) {
        let (handle, drain) = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.sender = None;
            match lifecycle.consumer.take() {
                Some(handle) => {
                    let drain = handle.watch();
                    lifecycle.draining = Some(drain.clone());
                    (Some(handle), drain)
                }
                None => match lifecycle.pending_drain() {
                    Some(drain) => (None, drain),
                    None => return,
                },
            }
        };

        let Some(handle) = handle else {
            wait_exited(drain).await;
            return;
        };

        tracing::info!(
            max_retry_delay_per_event_ms = self.config.retry.max_total_delay().as_millis() as u64,
            "waiting for queued events to be processed"
        );
        if let Err(e) = handle.stop().await {
            tracing::error!(error = %e, "event consumer task failed during shutdown");
        }

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle
            .draining
            .as_ref()
            .is_some_and(|state| state.same_channel(&drain))
        {
            lifecycle.draining = None;
        }
        if lifecycle.consumer.is_none() {
            lifecycle.stopped = true;
        }
        tracing::info!("ingestion service stopped");
    }

    /// Queues every event of `events` in order, starting the consumer if
    /// needed. Returns the number of events queued, not persisted.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::QueueClosed` if a concurrent `stop` closed the
    /// queue before the whole batch was queued; `accepted` events made it.
    pub async fn process_events(&self, events: Vec<Event>) -> Result<usize, IngestError> {
        // Push outside the lock so a producer waiting for queue room can
        // never block `stop`.
        let sender = self.running_sender().await;

        let total = events.len();
        let mut accepted = 0;
        for event in events {
            tracing::debug!(topic = %event.topic, event_id = %event.event_id, "event queued");
            if let Err(QueueClosed(event)) = sender.push(event).await {
                tracing::warn!(
                    accepted,
                    rejected = total - accepted,
                    first_rejected = %event.event_id,
                    "ingestion queue closed mid-batch"
                );
                return Err(IngestError::QueueClosed { accepted });
            }
            accepted += 1;
        }

        tracing::info!(count = accepted, "events added to processing queue");
        Ok(accepted)
    }

    /// Returns persisted events in insertion order, optionally for one topic.
    ///
    /// # Errors
    ///
    /// Returns `IngestError` if the store read fails.
    pub async fn get_events(&self, topic: Option<String>) -> Result<Vec<Event>, IngestError> {
        tracing::debug!(topic = topic.as_deref().unwrap_or("<all>"), "retrieving events");
        run_blocking(&self.store, move |store| store.query(topic.as_deref())).await
    }

    /// Returns the store's counters and distinct topics.
    ///
    /// # Errors
    ///
    /// Returns `IngestError` if the store read fails.
    pub async fn get_stats(&self) -> Result<Stats, IngestError> {
        let stats = run_blocking(&self.store, |store| store.stats()).await?;
        if !stats.is_conserved() {
            tracing::error!(
                received = stats.received,
                unique_processed = stats.unique_processed,
                duplicate_dropped = stats.duplicate_dropped,
                "persisted counters do not add up"
            );
        }
        Ok(stats)
    }

    /// Returns the current consumer state.
    pub async fn consumer_state(&self) -> ConsumerState {
        let lifecycle = self.lifecycle.lock().await;
        match (&lifecycle.consumer, &lifecycle.draining) {
            (Some(handle), _) => handle.state(),
            (None, Some(draining)) => *draining.borrow(),
            (None, None) if lifecycle.stopped => ConsumerState::Stopped,
            (None, None) => ConsumerState::Idle,
        }
    }

    /// Returns the in-process outcome counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// `false` once the consumer has seen a fatal store error.
    pub fn is_healthy(&self) -> bool {
        self.metrics.snapshot().fatal_errors == 0
    }

    async fn running_sender(&self) -> EventSender {
        loop {
            let drain = {
                let mut lifecycle = self.lifecycle.lock().await;
                match lifecycle.pending_drain() {
                    Some(drain) => drain,
                    None => return self.ensure_running(&mut lifecycle),
                }
            };
            tracing::debug!("waiting for the previous consumer to finish draining");
            wait_exited(drain).await;
        }
    }

    fn ensure_running(&self, lifecycle: &mut Lifecycle) -> EventSender {
        if let (Some(sender), Some(handle)) = (&lifecycle.sender, &lifecycle.consumer) {
            if !handle.is_finished() {
                return sender.clone();
            }
            tracing::warn!(state = %handle.state(), "event consumer exited unexpectedly, restarting");
        }

        let (sender, receiver) = queue::channel(self.config.queue_capacity);
        let consumer = Consumer::new(
            receiver,
            Arc::clone(&self.store),
            self.config.retry,
            Arc::clone(&self.metrics),
        );
        lifecycle.consumer = Some(consumer.spawn());
        lifecycle.sender = Some(sender.clone());
        lifecycle.stopped = false;

        tracing::info!(
            queue_capacity = self.config.queue_capacity,
            max_attempts = self.config.retry.max_attempts,
            retry_delay_ms = self.config.retry.delay.as_millis() as u64,
            "ingestion service started"
        );

        sender
    }
}
