//! The single background worker that drains the queue into the store.

use aggregator_store::EventStore;
use aggregator_types::{Event, InsertOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::queue::EventReceiver;
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::{run_blocking, IngestError};

/// Lifecycle of a [`Consumer`].
///
/// `Idle → Running → Draining → Stopped`. `Draining` is skipped when the
/// queue ends because every sender was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Created but not yet spawned.
    Idle,
    /// Popping and persisting events.
    Running,
    /// Stop requested; finishing events that were already queued.
    Draining,
    /// Terminal.
    Stopped,
}

impl ConsumerState {
    /// Returns the canonical string label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-process outcome counters, shared across consumer restarts.
///
/// These complement the durable counters in the store: they record what the
/// store never saw (events dropped after failures).
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    inserted: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    fatal_errors: AtomicU64,
}

/// Point-in-time copy of [`ConsumerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Events this process inserted.
    pub inserted: u64,
    /// Events this process found already persisted.
    pub duplicates: u64,
    /// Events abandoned after a fatal error or an exhausted retry budget.
    pub dropped: u64,
    /// Fatal store errors seen.
    pub fatal_errors: u64,
}

impl ConsumerMetrics {
    /// Reads all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

/// Pops events one at a time and persists them with bounded retries.
pub struct Consumer {
    receiver: EventReceiver,
    store: Arc<dyn EventStore>,
    policy: RetryPolicy,
    metrics: Arc<ConsumerMetrics>,
    state: watch::Sender<ConsumerState>,
}

impl Consumer {
    /// Creates an idle consumer bound to `receiver`.
    pub fn new(
        receiver: EventReceiver,
        store: Arc<dyn EventStore>,
        policy: RetryPolicy,
        metrics: Arc<ConsumerMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            receiver,
            store,
            policy,
            metrics,
            state,
        }
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Starts the consumer on the current Tokio runtime.
    pub fn spawn(self) -> ConsumerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let state = self.subscribe();
        let task = tokio::spawn(self.run(stop_rx));
        ConsumerHandle {
            stop: Some(stop_tx),
            state,
            task,
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        self.state.send_replace(ConsumerState::Running);
        tracing::info!("event consumer started");

        let mut draining = false;
        loop {
            let next = tokio::select! {
                biased;
                // A dropped handle counts as a stop request.
                _ = &mut stop, if !draining => {
                    draining = true;
                    self.receiver.close();
                    self.state.send_replace(ConsumerState::Draining);
                    tracing::info!(remaining = self.receiver.len(), "draining event queue");
                    continue;
                }
                next = self.receiver.pop() => next,
            };

            match next {
                Some(event) => self.process(event).await,
                None => break,
            }
        }

        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!("event consumer stopped");
    }

    async fn process(&self, event: Event) {
        tracing::debug!(topic = %event.topic, event_id = %event.event_id, "processing event");

        let result = retry(self.policy, IngestError::is_transient, |_attempt| {
            let event = event.clone();
            let store = &self.store;
            async move { run_blocking(store, move |store| store.try_insert(&event)).await }
        })
        .await;

        match result {
            Ok(outcome) => {
                let counter = match outcome {
                    InsertOutcome::Inserted => &self.metrics.inserted,
                    InsertOutcome::Duplicate => &self.metrics.duplicates,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    %outcome,
                    "event processed"
                );
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    attempts,
                    error = %last,
                    "dropping event after exhausting retries"
                );
            }
            Err(RetryError::Fatal { attempt, error }) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.fatal_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    attempt,
                    error = %error,
                    "dropping event after fatal store error"
                );
            }
        }
    }
}

/// Owner's handle to a spawned [`Consumer`].
pub struct ConsumerHandle {
    stop: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Returns the consumer's current state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state transitions.
    pub fn watch(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Returns `true` once the consumer task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the consumer to drain and stop without waiting for it.
    pub fn request_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // Err means the task already exited.
            let _ = stop.send(());
        }
    }

    /// Asks the consumer to drain, then waits until it has stopped.
    ///
    /// # Errors
    ///
    /// Returns the `JoinError` if the consumer task panicked.
    pub async fn stop(mut self) -> Result<(), JoinError> {
        self.request_stop();
        self.task.await
    }
}
