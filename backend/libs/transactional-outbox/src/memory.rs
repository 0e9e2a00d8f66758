//! In-memory outbox used by tests across the workspace.
//!
//! Implements both outbox traits against a plain `Vec`, ignoring the
//! session argument (callers pair it with `DbSession::detached()`). No
//! row locking: the single-poller test harnesses never contend.

use async_trait::async_trait;
use chrono::Utc;
use db_pool::DbSession;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::{truncate_error, OutboxEvent, OutboxRepository, OutboxResult, OutboxStore};

/// Clones share the same underlying store, so a harness can hand the
/// store to the code under test and keep a handle for assertions.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    events: Arc<Mutex<Vec<OutboxEvent>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored event, in insertion order.
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.events.lock().clone()
    }

    pub fn get(&self, event_id: Uuid) -> Option<OutboxEvent> {
        self.events.lock().iter().find(|e| e.id == event_id).cloned()
    }

    /// Force a processed row back to claimable, as an operator replay
    /// would. Attempt counters are preserved.
    pub fn reset_processed(&self, event_id: Uuid) {
        let mut events = self.events.lock();
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.processed_at = None;
        }
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxStore {
    async fn append(&self, _session: &DbSession, event: &OutboxEvent) -> OutboxResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_batch(&self, _session: &DbSession, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let events = self.events.lock();
        let mut pending: Vec<OutboxEvent> = events
            .iter()
            .filter(|e| e.processed_at.is_none())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn mark_processed(&self, _session: &DbSession, event_id: Uuid) -> OutboxResult<()> {
        let mut events = self.events.lock();
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        _session: &DbSession,
        event_id: Uuid,
        attempts: i32,
        error: &str,
    ) -> OutboxResult<()> {
        let mut events = self.events.lock();
        if let Some(event) = events.iter_mut().find(|e| e.id == event_id) {
            event.attempts = attempts;
            event.last_error = Some(truncate_error(error));
        }
        Ok(())
    }

    async fn pending_stats(&self, _session: &DbSession) -> OutboxResult<(i64, i64)> {
        let events = self.events.lock();
        let pending: Vec<_> = events.iter().filter(|e| e.processed_at.is_none()).collect();
        let age = pending
            .iter()
            .map(|e| (Utc::now() - e.created_at).num_seconds().max(0))
            .max()
            .unwrap_or(0);
        Ok((pending.len() as i64, age))
    }
}
