//! # Transactional Outbox
//!
//! Reliable at-least-once event delivery for the device platform. Domain
//! events are appended to the `outbox` table inside the same database
//! transaction as the aggregate write, so either both commit or neither
//! does. A background worker later claims unprocessed rows with a
//! row-level lock that skips rows held by peer pollers, dispatches them,
//! and marks them processed (or dead-lettered once the retry budget is
//! spent).
//!
//! ## Appending an event with the aggregate write
//!
//! ```rust,no_run
//! use db_pool::DbSession;
//! use transactional_outbox::{OutboxEvent, OutboxRepository, SqlxOutboxRepository};
//! # async fn example(session: DbSession) -> anyhow::Result<()> {
//! let outbox = SqlxOutboxRepository;
//! // ... aggregate INSERT/UPDATE through the same session ...
//! let event = OutboxEvent::new(
//!     uuid::Uuid::new_v4(),
//!     "device.created",
//!     serde_json::json!({"device_id": "…", "user_id": "…"}),
//! );
//! outbox.append(&session, &event).await?;
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The claim side ([`OutboxStore`]) is driven by the worker's poller; both
//! sides run against the shared [`DbSession`] so a whole claimed batch and
//! its row updates commit atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_pool::DbSession;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

mod error;
pub mod memory;

pub use error::{OutboxError, OutboxResult};
pub use memory::InMemoryOutboxStore;

/// Upper bound for stored error strings.
pub const MAX_LAST_ERROR_LEN: usize = 512;

/// Truncate an error message to [`MAX_LAST_ERROR_LEN`] bytes without
/// splitting a UTF-8 character.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_LAST_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_LAST_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// A row in the `outbox` table.
///
/// Rows are append-only until processed; `processed_at` is set exactly
/// once and is terminal. A terminal row with a non-null `last_error` and
/// `attempts >= max` is dead-lettered rather than successful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Short event type string, e.g. `device.retired`
    pub event_type: String,
    /// Opaque JSON payload owned by the event producer
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    pub fn new(tenant_id: Uuid, event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
            processed_at: None,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Write side: atomic append alongside the aggregate mutation.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new event through the caller's session so the append
    /// commits with the business write or not at all.
    async fn append(&self, session: &DbSession, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Claim side: the worker's view of the outbox.
///
/// All methods run through the poller's per-iteration session; the claim
/// and every row-status update for the batch commit together.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` unprocessed rows in `created_at ASC` order,
    /// holding a row-level lock that skips rows locked by peer pollers.
    async fn claim_batch(&self, session: &DbSession, limit: i64) -> OutboxResult<Vec<OutboxEvent>>;

    /// Terminal marker, used both for successful processing and for
    /// dead-lettering (the latter distinguished by `last_error`).
    async fn mark_processed(&self, session: &DbSession, event_id: Uuid) -> OutboxResult<()>;

    /// Record a failed attempt: absolute attempt count plus the
    /// truncated error text. Leaves the row claimable.
    async fn record_failure(
        &self,
        session: &DbSession,
        event_id: Uuid,
        attempts: i32,
        error: &str,
    ) -> OutboxResult<()>;

    /// Pending row count and oldest pending age in seconds (0 when empty).
    async fn pending_stats(&self, session: &DbSession) -> OutboxResult<(i64, i64)>;
}

/// PostgreSQL implementation of both outbox traits.
pub struct SqlxOutboxRepository;

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn append(&self, session: &DbSession, event: &OutboxEvent) -> OutboxResult<()> {
        let mut conn = session.acquire().await;
        sqlx::query(
            r#"
            INSERT INTO outbox (
                id,
                tenant_id,
                event_type,
                payload,
                created_at,
                processed_at,
                attempts,
                last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.processed_at)
        .bind(event.attempts)
        .bind(&event.last_error)
        .execute(conn.conn()?)
        .await?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            "event appended to outbox"
        );

        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqlxOutboxRepository {
    async fn claim_batch(&self, session: &DbSession, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let mut conn = session.acquire().await;
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                tenant_id,
                event_type,
                payload,
                created_at,
                processed_at,
                attempts,
                last_error
            FROM outbox
            WHERE processed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(conn.conn()?)
        .await?;

        let events = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEvent {
                    id: row.try_get("id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                    processed_at: row.try_get("processed_at")?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        debug!(count = events.len(), "claimed outbox batch");
        Ok(events)
    }

    async fn mark_processed(&self, session: &DbSession, event_id: Uuid) -> OutboxResult<()> {
        let mut conn = session.acquire().await;
        let result = sqlx::query("UPDATE outbox SET processed_at = NOW() WHERE id = $1")
            .bind(event_id)
            .execute(conn.conn()?)
            .await?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "outbox row missing when marking processed");
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        session: &DbSession,
        event_id: Uuid,
        attempts: i32,
        error: &str,
    ) -> OutboxResult<()> {
        let mut conn = session.acquire().await;
        sqlx::query("UPDATE outbox SET attempts = $2, last_error = $3 WHERE id = $1")
            .bind(event_id)
            .bind(attempts)
            .bind(truncate_error(error))
            .execute(conn.conn()?)
            .await?;
        Ok(())
    }

    async fn pending_stats(&self, session: &DbSession) -> OutboxResult<(i64, i64)> {
        let mut conn = session.acquire().await;
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox
            WHERE processed_at IS NULL
            "#,
        )
        .fetch_one(conn.conn()?)
        .await?;

        let pending: i64 = row.try_get("pending")?;
        let age: i64 = row.try_get("age_seconds")?;
        Ok((pending, age))
    }
}

impl SqlxOutboxRepository {
    /// Reset `processed_at` and retry counters for events created since
    /// the given timestamp. Operational backfill; downstream handlers are
    /// idempotent, so replays are safe.
    pub async fn replay_since(
        &self,
        session: &DbSession,
        since: DateTime<Utc>,
    ) -> OutboxResult<u64> {
        let mut conn = session.acquire().await;
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET processed_at = NULL,
                attempts = 0,
                last_error = NULL
            WHERE created_at >= $1
            "#,
        )
        .bind(since)
        .execute(conn.conn()?)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_starts_unprocessed() {
        let event = OutboxEvent::new(
            Uuid::new_v4(),
            "device.created",
            serde_json::json!({"device_id": "d"}),
        );
        assert!(event.processed_at.is_none());
        assert_eq!(event.attempts, 0);
        assert!(event.last_error.is_none());
    }

    #[test]
    fn truncate_keeps_short_messages() {
        assert_eq!(truncate_error("boom"), "boom");
    }

    #[test]
    fn truncate_caps_long_messages() {
        let long = "x".repeat(2000);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.len(), MAX_LAST_ERROR_LEN);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // 3-byte characters; 512 is not a multiple of 3, so the cap
        // falls inside a character and must be pulled back.
        let long = "€".repeat(600);
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= MAX_LAST_ERROR_LEN);
        assert!(truncated.chars().all(|c| c == '€'));
    }
}
