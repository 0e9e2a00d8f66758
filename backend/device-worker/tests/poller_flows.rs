//! Polling-loop behaviour driven end to end over the in-memory outbox
//! store: at-least-once delivery, attempt accounting, circuit-open
//! skips, failure isolation, and dead-lettering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use db_pool::{DbSession, SessionSource};
use device_worker::dispatch::{DispatchError, EventHandler};
use device_worker::poller::{OutboxPoller, PollerConfig};
use parking_lot::Mutex;
use resilience::RetryPolicy;
use transactional_outbox::{InMemoryOutboxStore, OutboxEvent, OutboxRepository};
use uuid::Uuid;

#[derive(Clone, Copy)]
enum FailureMode {
    Transient,
    CircuitOpen,
}

/// Handler double: records every call, fails scripted event ids.
#[derive(Clone, Default)]
struct ScriptedHandler {
    calls: Arc<Mutex<Vec<Uuid>>>,
    failures: Arc<Mutex<HashMap<Uuid, FailureMode>>>,
}

impl ScriptedHandler {
    fn fail(&self, event_id: Uuid, mode: FailureMode) {
        self.failures.lock().insert(event_id, mode);
    }

    fn calls_for(&self, event_id: Uuid) -> usize {
        self.calls.lock().iter().filter(|id| **id == event_id).count()
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(&self, _session: &DbSession, event: &OutboxEvent) -> Result<(), DispatchError> {
        self.calls.lock().push(event.id);
        match self.failures.lock().get(&event.id) {
            Some(FailureMode::Transient) => Err(DispatchError::Other(anyhow::anyhow!("boom"))),
            Some(FailureMode::CircuitOpen) => Err(DispatchError::CircuitOpen("tenancy".into())),
            None => Ok(()),
        }
    }
}

struct Harness {
    poller: OutboxPoller<InMemoryOutboxStore, ScriptedHandler>,
    store: InMemoryOutboxStore,
    handler: ScriptedHandler,
}

fn harness() -> Harness {
    let store = InMemoryOutboxStore::new();
    let handler = ScriptedHandler::default();
    let poller = OutboxPoller::new(
        store.clone(),
        handler.clone(),
        SessionSource::Detached,
        PollerConfig {
            batch_size: 10,
            poll_interval: Duration::from_millis(1),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                max_attempts: 5,
            },
        },
    );
    Harness {
        poller,
        store,
        handler,
    }
}

async fn seed(store: &InMemoryOutboxStore, event_type: &str) -> OutboxEvent {
    let event = OutboxEvent::new(
        Uuid::new_v4(),
        event_type,
        serde_json::json!({"device_id": Uuid::new_v4().to_string(), "user_id": "user-1"}),
    );
    store.append(&DbSession::detached(), &event).await.unwrap();
    event
}

#[tokio::test]
async fn successful_event_is_marked_processed_once() {
    let h = harness();
    let event = seed(&h.store, "device.created").await;

    let processed = h.poller.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    let stored = h.store.get(event.id).unwrap();
    assert!(stored.processed_at.is_some());
    assert_eq!(stored.attempts, 0);
    assert!(stored.last_error.is_none());

    // The terminal row is never handed out again.
    h.poller.process_batch().await.unwrap();
    assert_eq!(h.handler.calls_for(event.id), 1);
}

#[tokio::test]
async fn transient_failures_accumulate_attempts_then_dead_letter() {
    let h = harness();
    let event = seed(&h.store, "device.created").await;
    h.handler.fail(event.id, FailureMode::Transient);

    for expected_attempts in 1..=4 {
        h.poller.process_batch().await.unwrap();
        let stored = h.store.get(event.id).unwrap();
        assert_eq!(stored.attempts, expected_attempts);
        assert!(stored.processed_at.is_none());
        assert!(stored.last_error.is_some());
    }

    // Fifth failure exhausts the budget: terminal, error retained.
    h.poller.process_batch().await.unwrap();
    let stored = h.store.get(event.id).unwrap();
    assert_eq!(stored.attempts, 5);
    assert!(stored.processed_at.is_some());
    assert!(stored.last_error.is_some());

    // No further processing once dead-lettered.
    h.poller.process_batch().await.unwrap();
    assert_eq!(h.handler.calls_for(event.id), 5);
}

#[tokio::test]
async fn circuit_open_skips_without_charging_an_attempt() {
    let h = harness();
    let event = seed(&h.store, "device.activated").await;
    h.handler.fail(event.id, FailureMode::CircuitOpen);

    for _ in 0..3 {
        let processed = h.poller.process_batch().await.unwrap();
        assert_eq!(processed, 0);
    }

    let stored = h.store.get(event.id).unwrap();
    assert_eq!(stored.attempts, 0);
    assert!(stored.processed_at.is_none());
    assert!(stored.last_error.is_none());

    // Once the breaker closes again the row goes through.
    h.handler.failures.lock().remove(&event.id);
    assert_eq!(h.poller.process_batch().await.unwrap(), 1);
    assert!(h.store.get(event.id).unwrap().processed_at.is_some());
}

#[tokio::test]
async fn one_failing_row_does_not_block_the_rest_of_the_batch() {
    let h = harness();
    let failing = seed(&h.store, "device.created").await;
    let healthy = seed(&h.store, "device.activated").await;
    h.handler.fail(failing.id, FailureMode::Transient);

    let processed = h.poller.process_batch().await.unwrap();
    assert_eq!(processed, 1);

    assert!(h.store.get(healthy.id).unwrap().processed_at.is_some());
    let failed = h.store.get(failing.id).unwrap();
    assert!(failed.processed_at.is_none());
    assert_eq!(failed.attempts, 1);
    assert_eq!(h.handler.calls_for(healthy.id), 1);
}

#[tokio::test]
async fn replayed_events_are_tolerated() {
    let h = harness();
    let event = seed(&h.store, "device.created").await;

    h.poller.process_batch().await.unwrap();
    assert!(h.store.get(event.id).unwrap().processed_at.is_some());

    // An operator forces the row back to claimable; at-least-once means
    // the handler simply runs again and the row goes terminal again.
    h.store.reset_processed(event.id);
    assert_eq!(h.poller.process_batch().await.unwrap(), 1);
    assert_eq!(h.handler.calls_for(event.id), 2);
    assert!(h.store.get(event.id).unwrap().processed_at.is_some());
}

#[tokio::test]
async fn batches_are_capped_at_batch_size() {
    let h = harness();
    for _ in 0..15 {
        seed(&h.store, "device.created").await;
    }

    assert_eq!(h.poller.process_batch().await.unwrap(), 10);
    assert_eq!(h.poller.process_batch().await.unwrap(), 5);
    assert_eq!(h.poller.process_batch().await.unwrap(), 0);
}

#[tokio::test]
async fn run_loop_stops_on_shutdown_after_finishing_the_batch() {
    let h = harness();
    let event = seed(&h.store, "device.created").await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    shutdown_tx.send(()).unwrap();

    // With the signal already queued the loop runs exactly one batch.
    h.poller.run(shutdown_rx).await;
    assert!(h.store.get(event.id).unwrap().processed_at.is_some());
}
