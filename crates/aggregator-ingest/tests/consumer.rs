//! State-machine tests for the background consumer.

mod common;

use aggregator_ingest::{queue, Consumer, ConsumerMetrics, ConsumerState};
use aggregator_store::EventStore;
use common::{event, fast_retry, memory_store, GatedStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

async fn reach(state: &mut watch::Receiver<ConsumerState>, target: ConsumerState) {
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("consumer never reached {target}"))
        .expect("state channel closed early");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_moves_through_draining_and_finishes_queued_events() {
    let (store, permits) = GatedStore::new();
    let store: Arc<dyn EventStore> = Arc::new(store);
    let (tx, rx) = queue::channel(8);
    tx.push(event("t", "1")).await.unwrap();
    tx.push(event("t", "2")).await.unwrap();

    let metrics = Arc::new(ConsumerMetrics::default());
    let consumer = Consumer::new(rx, store.clone(), fast_retry(), metrics.clone());
    let mut state = consumer.subscribe();
    assert_eq!(*state.borrow(), ConsumerState::Idle);

    let mut handle = consumer.spawn();
    reach(&mut state, ConsumerState::Running).await;

    // The first event is held at the gate while the stop request lands.
    handle.request_stop();
    permits.send(()).unwrap();
    reach(&mut state, ConsumerState::Draining).await;

    let rejected = tx
        .push(event("t", "3"))
        .await
        .expect_err("queue should refuse pushes while draining");
    assert_eq!(rejected.0.event_id, "3");

    permits.send(()).unwrap();
    reach(&mut state, ConsumerState::Stopped).await;
    handle.stop().await.expect("consumer task should not panic");

    let ids: Vec<String> = store
        .query(Some("t"))
        .unwrap()
        .into_iter()
        .map(|e| e.event_id)
        .collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert_eq!(metrics.snapshot().inserted, 2);
}

#[tokio::test]
async fn dropping_every_sender_stops_without_draining() {
    let store: Arc<dyn EventStore> = Arc::new(memory_store());
    let (tx, rx) = queue::channel(4);
    tx.push(event("t", "1")).await.unwrap();
    tx.push(event("t", "1")).await.unwrap();
    drop(tx);

    let metrics = Arc::new(ConsumerMetrics::default());
    let consumer = Consumer::new(rx, store.clone(), fast_retry(), metrics.clone());
    let handle = consumer.spawn();
    let mut state = handle.watch();

    let mut seen = Vec::new();
    loop {
        let current = *state.borrow_and_update();
        if seen.last() != Some(&current) {
            seen.push(current);
        }
        if current == ConsumerState::Stopped {
            break;
        }
        timeout(Duration::from_secs(5), state.changed())
            .await
            .expect("consumer should finish")
            .expect("state channel closed early");
    }
    assert!(!seen.contains(&ConsumerState::Draining), "saw {seen:?}");

    handle.stop().await.unwrap();
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.inserted, 1);
    assert_eq!(snapshot.duplicates, 1);
    assert_eq!(snapshot.dropped, 0);
}

#[tokio::test]
async fn stop_on_an_empty_queue_returns_promptly() {
    let store: Arc<dyn EventStore> = Arc::new(memory_store());
    let (_tx, rx) = queue::channel(4);
    let handle = Consumer::new(rx, store, fast_retry(), Arc::default()).spawn();

    timeout(Duration::from_secs(1), handle.stop())
        .await
        .expect("stop should not hang on an empty queue")
        .unwrap();
}
