//! Bounded FIFO queue between producers and the consumer.
//!
//! The queue applies backpressure: when it is full, [`EventSender::push`]
//! waits for the consumer to make room instead of dropping the event.
//! [`EventReceiver::close`] starts a drain: further pushes fail with
//! [`QueueClosed`] (including pushes already waiting for room), while
//! events that were already queued can still be popped until the queue is
//! empty.

use aggregator_types::Event;
use tokio::sync::mpsc;

/// Returned when pushing onto a closed queue. Carries the rejected event.
#[derive(Debug, thiserror::Error)]
#[error("ingestion queue is closed")]
pub struct QueueClosed(pub Event);

/// Creates a queue holding at most `capacity` pending events.
///
/// A capacity of zero is treated as one.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { inner: tx }, EventReceiver { inner: rx })
}

/// Producer half of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: mpsc::Sender<Event>,
}

impl EventSender {
    /// Appends `event` to the tail of the queue, waiting while it is full.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] with the event if the queue has been closed.
    pub async fn push(&self, event: Event) -> Result<(), QueueClosed> {
        self.inner
            .send(event)
            .await
            .map_err(|mpsc::error::SendError(event)| QueueClosed(event))
    }

    /// Returns `true` once the receiving half has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consumer half of the queue. There is exactly one per queue.
#[derive(Debug)]
pub struct EventReceiver {
    inner: mpsc::Receiver<Event>,
}

impl EventReceiver {
    /// Removes the event at the head of the queue, waiting while it is empty.
    ///
    /// Returns `None` once the queue is closed (or every sender is gone) and
    /// no buffered events remain. Cancel-safe: dropping the future before it
    /// completes never loses an event.
    pub async fn pop(&mut self) -> Option<Event> {
        self.inner.recv().await
    }

    /// Refuses further pushes while leaving buffered events poppable.
    pub fn close(&mut self) {
        self.inner.close();
    }

    /// Number of events currently buffered.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
