//! Per-event dispatch: projection first, then side effects.
//!
//! The read-model projection always runs, so the query surface reflects
//! reality even when a side effect fails. The side-effect switch is a
//! closed match over the known event types; unknown types and payloads
//! without a user id are successful no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use db_pool::DbSession;
use event_schema::{DeviceEventKind, DeviceEventPayload};
use resilience::{CircuitBreaker, CircuitBreakerError};
use thiserror::Error;
use tracing::debug;
use transactional_outbox::OutboxEvent;
use uuid::Uuid;

use crate::clients::{EmailApi, TenancyApi};
use crate::projector::ReadModelProjector;
use crate::sagas::{DeviceRetirementSaga, SagaStateStore};

/// How processing one event ended, when it did not succeed.
///
/// `CircuitOpen` means the work was refused, not attempted: the poller
/// skips the row without charging an attempt. Everything else is a
/// transient failure that increments the attempt counter.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CircuitBreakerError> for DispatchError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open(name) => DispatchError::CircuitOpen(name),
            failed @ CircuitBreakerError::CallFailed(_) => {
                DispatchError::Other(anyhow::Error::new(failed))
            }
        }
    }
}

impl From<db_pool::SessionError> for DispatchError {
    fn from(err: db_pool::SessionError) -> Self {
        DispatchError::Other(anyhow::Error::new(err))
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        DispatchError::Other(anyhow::Error::new(err))
    }
}

/// Processes one claimed outbox event within the poller's session.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, session: &DbSession, event: &OutboxEvent) -> Result<(), DispatchError>;
}

pub struct DeviceEventHandler<P, S> {
    projector: P,
    saga: DeviceRetirementSaga<S>,
    tenancy: Arc<dyn TenancyApi>,
    email: Arc<dyn EmailApi>,
    tenancy_breaker: CircuitBreaker,
    email_breaker: CircuitBreaker,
}

impl<P: ReadModelProjector, S: SagaStateStore> DeviceEventHandler<P, S> {
    pub fn new(
        projector: P,
        saga: DeviceRetirementSaga<S>,
        tenancy: Arc<dyn TenancyApi>,
        email: Arc<dyn EmailApi>,
        tenancy_breaker: CircuitBreaker,
        email_breaker: CircuitBreaker,
    ) -> Self {
        Self {
            projector,
            saga,
            tenancy,
            email,
            tenancy_breaker,
            email_breaker,
        }
    }

    async fn side_effect(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        kind: DeviceEventKind,
        payload: &DeviceEventPayload,
    ) -> Result<(), DispatchError> {
        let Some(user_id) = payload.user_id.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(());
        };

        match kind {
            DeviceEventKind::Retired => {
                let device_id = payload.device_id.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("device.retired event is missing device_id")
                })?;
                self.saga
                    .start(
                        session,
                        tenant_id,
                        device_id,
                        user_id,
                        payload.reason.as_deref().unwrap_or(""),
                    )
                    .await
            }
            DeviceEventKind::Activated => {
                self.notify(user_id, "Device activated", "Your device is active.")
                    .await
            }
            DeviceEventKind::Created => {
                self.notify(
                    user_id,
                    "Device registered",
                    "Your device has been registered.",
                )
                .await
            }
        }
    }

    /// Plain notification for non-saga events. An unresolvable email is
    /// a no-op; an open breaker bubbles up and skips the row.
    async fn notify(
        &self,
        user_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DispatchError> {
        let email = self
            .tenancy_breaker
            .call(|| self.tenancy.resolve_user_email(user_id))
            .await?;
        let Some(email) = email.filter(|e| !e.is_empty()) else {
            return Ok(());
        };

        self.email_breaker
            .call(|| self.email.send(&email, subject, body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<P: ReadModelProjector, S: SagaStateStore> EventHandler for DeviceEventHandler<P, S> {
    async fn handle(&self, session: &DbSession, event: &OutboxEvent) -> Result<(), DispatchError> {
        let Some(kind) = DeviceEventKind::from_event_type(&event.event_type) else {
            debug!(event_id = %event.id, event_type = %event.event_type, "ignoring unknown event type");
            return Ok(());
        };
        let payload = DeviceEventPayload::parse(&event.payload);

        self.projector.project(session, kind, &payload).await?;
        self.side_effect(session, event.tenant_id, kind, &payload).await
    }
}
