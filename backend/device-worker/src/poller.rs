//! Outbox polling loop.
//!
//! Each iteration is one transaction: claim a batch of unprocessed rows
//! (skipping rows locked by peer pollers), dispatch them in order, and
//! record each row's outcome. A failure on one row never prevents the
//! rest of the batch from being attempted; a `CircuitOpen` outcome skips
//! the row without charging an attempt, because the work was refused,
//! not tried.

use db_pool::SessionSource;
use resilience::RetryPolicy;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use transactional_outbox::{truncate_error, OutboxStore};

use crate::dispatch::{DispatchError, EventHandler};

#[derive(Clone)]
pub struct PollerConfig {
    /// Rows claimed per iteration
    pub batch_size: i64,
    /// Sleep between iterations
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct OutboxPoller<S, H> {
    store: S,
    handler: H,
    sessions: SessionSource,
    config: PollerConfig,
}

impl<S: OutboxStore, H: EventHandler> OutboxPoller<S, H> {
    pub fn new(store: S, handler: H, sessions: SessionSource, config: PollerConfig) -> Self {
        Self {
            store,
            handler,
            sessions,
            config,
        }
    }

    /// Poll until the shutdown signal arrives. The current batch always
    /// runs to completion and commits before the loop exits.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_attempts = self.config.retry.max_attempts,
            "outbox poller started"
        );

        loop {
            match self.process_batch().await {
                Ok(0) => debug!("no outbox events to process"),
                Ok(count) => info!(processed = count, "processed outbox events"),
                // Database connectivity loss lands here; log and try
                // again on the next tick.
                Err(err) => error!(error = %err, "poll iteration failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("shutdown signal received, outbox poller stopping");
                    break;
                }
            }
        }
    }

    /// One polling iteration. Returns the number of successfully
    /// processed events.
    pub async fn process_batch(&self) -> anyhow::Result<usize> {
        let session = self.sessions.open().await?;
        let events = self
            .store
            .claim_batch(&session, self.config.batch_size)
            .await?;
        if !events.is_empty() {
            info!(count = events.len(), "claimed outbox events");
        }

        let mut processed = 0;
        for event in &events {
            match self.handler.handle(&session, event).await {
                Ok(()) => {
                    self.store.mark_processed(&session, event.id).await?;
                    debug!(event_id = %event.id, "outbox event processed");
                    processed += 1;
                }
                Err(DispatchError::CircuitOpen(circuit)) => {
                    // Refused, not attempted: no attempt charged, the row
                    // stays claimable for a later iteration.
                    warn!(
                        event_id = %event.id,
                        circuit = %circuit,
                        "outbox event skipped, circuit open"
                    );
                }
                Err(err) => {
                    let attempts = event.attempts + 1;
                    let backoff = self.config.retry.backoff_delay(attempts as u32);
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempt = attempts,
                        max_attempts = self.config.retry.max_attempts,
                        backoff_hint_secs = backoff.as_secs_f64(),
                        error = %err,
                        "outbox event processing failed"
                    );
                    self.store
                        .record_failure(
                            &session,
                            event.id,
                            attempts,
                            &truncate_error(&err.to_string()),
                        )
                        .await?;

                    if self.config.retry.is_exhausted(attempts as u32) {
                        error!(
                            event_id = %event.id,
                            attempts,
                            "outbox event dead-lettered"
                        );
                        self.store.mark_processed(&session, event.id).await?;
                    }
                }
            }
        }

        let (pending, oldest_age) = self.store.pending_stats(&session).await?;
        debug!(pending, oldest_age_secs = oldest_age, "outbox backlog");

        session.commit().await?;
        Ok(processed)
    }
}
