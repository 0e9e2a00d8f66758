//! Read-model projection.
//!
//! Idempotent upserts into `device_read_model`, sourced from the
//! authoritative `devices` row: re-applying an event leaves the row in
//! the same state, because the source row already carries the newer
//! version. `owner_email` is resolved just-in-time and is best-effort:
//! an unknown user, a lookup miss, or a breaker refusal all project NULL
//! (COALESCE keeps any previously resolved value).

use std::sync::Arc;

use async_trait::async_trait;
use db_pool::DbSession;
use event_schema::{DeviceEventKind, DeviceEventPayload};
use resilience::{CircuitBreaker, CircuitBreakerError};
use tracing::debug;
use uuid::Uuid;

use crate::clients::TenancyApi;
use crate::dispatch::DispatchError;

#[async_trait]
pub trait ReadModelProjector: Send + Sync {
    async fn project(
        &self,
        session: &DbSession,
        kind: DeviceEventKind,
        payload: &DeviceEventPayload,
    ) -> Result<(), DispatchError>;
}

pub struct SqlxReadModelProjector {
    tenancy: Arc<dyn TenancyApi>,
    tenancy_breaker: CircuitBreaker,
}

impl SqlxReadModelProjector {
    pub fn new(tenancy: Arc<dyn TenancyApi>, tenancy_breaker: CircuitBreaker) -> Self {
        Self {
            tenancy,
            tenancy_breaker,
        }
    }

    async fn resolve_owner_email(
        &self,
        payload: &DeviceEventPayload,
    ) -> Result<Option<String>, DispatchError> {
        let Some(user_id) = payload.user_id.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };

        match self
            .tenancy_breaker
            .call(|| self.tenancy.resolve_user_email(user_id))
            .await
        {
            Ok(email) => Ok(email.filter(|e| !e.is_empty())),
            Err(CircuitBreakerError::Open(name)) => {
                debug!(circuit = %name, "owner email lookup refused, projecting without it");
                Ok(None)
            }
            Err(failed) => Err(DispatchError::Other(anyhow::Error::new(failed))),
        }
    }
}

#[async_trait]
impl ReadModelProjector for SqlxReadModelProjector {
    async fn project(
        &self,
        session: &DbSession,
        kind: DeviceEventKind,
        payload: &DeviceEventPayload,
    ) -> Result<(), DispatchError> {
        let Some(device_id) = payload.device_id.as_deref() else {
            return Ok(());
        };
        let device_id = Uuid::parse_str(device_id)
            .map_err(|e| anyhow::anyhow!("invalid device_id in payload: {e}"))?;

        match kind {
            DeviceEventKind::Created => {
                let owner_email = self.resolve_owner_email(payload).await?;

                let mut conn = session.acquire().await;
                sqlx::query(
                    r#"
                    INSERT INTO device_read_model
                        (id, tenant_id, mac_address, status, owner_email, created_at, updated_at, version)
                    SELECT d.id, d.tenant_id, d.mac_address, d.status, $2, d.created_at, d.updated_at, d.version
                    FROM devices d
                    WHERE d.id = $1
                    ON CONFLICT (id) DO UPDATE SET
                        status = EXCLUDED.status,
                        owner_email = COALESCE($2, device_read_model.owner_email),
                        updated_at = EXCLUDED.updated_at,
                        version = EXCLUDED.version
                    "#,
                )
                .bind(device_id)
                .bind(owner_email)
                .execute(conn.conn()?)
                .await?;
            }
            DeviceEventKind::Retired | DeviceEventKind::Activated => {
                let mut conn = session.acquire().await;
                sqlx::query(
                    r#"
                    UPDATE device_read_model
                    SET status = d.status, updated_at = d.updated_at, version = d.version
                    FROM devices d
                    WHERE device_read_model.id = $1
                      AND d.id = $1
                    "#,
                )
                .bind(device_id)
                .execute(conn.conn()?)
                .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{MockTenancy, TenancyBehavior};
    use resilience::CircuitBreakerConfig;

    fn projector(tenancy: TenancyBehavior) -> (SqlxReadModelProjector, CircuitBreaker) {
        let breaker = CircuitBreaker::new("tenancy", CircuitBreakerConfig::default());
        (
            SqlxReadModelProjector::new(Arc::new(MockTenancy::with(tenancy)), breaker.clone()),
            breaker,
        )
    }

    #[tokio::test]
    async fn payload_without_device_id_is_a_noop() {
        let (projector, _) = projector(TenancyBehavior::NoEmail);
        // A detached session proves no SQL is attempted.
        let result = projector
            .project(
                &DbSession::detached(),
                DeviceEventKind::Created,
                &DeviceEventPayload::default(),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_device_id_is_a_transient_error() {
        let (projector, _) = projector(TenancyBehavior::NoEmail);
        let payload = DeviceEventPayload {
            device_id: Some("not-a-uuid".into()),
            user_id: Some("user-1".into()),
            reason: None,
        };
        let result = projector
            .project(&DbSession::detached(), DeviceEventKind::Retired, &payload)
            .await;
        assert!(matches!(result, Err(DispatchError::Other(_))));
    }

    #[tokio::test]
    async fn owner_email_lookup_is_best_effort_when_breaker_is_open() {
        let (projector, breaker) = projector(TenancyBehavior::Email("u@example.com".into()));
        for _ in 0..5 {
            let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
        }

        let payload = DeviceEventPayload {
            device_id: None,
            user_id: Some("user-1".into()),
            reason: None,
        };
        // Breaker open resolves to "unknown" instead of an error.
        let email = projector.resolve_owner_email(&payload).await.unwrap();
        assert!(email.is_none());
    }

    #[tokio::test]
    async fn transport_failure_during_lookup_fails_the_row() {
        let (projector, _) = projector(TenancyBehavior::Fail);
        let payload = DeviceEventPayload {
            device_id: None,
            user_id: Some("user-1".into()),
            reason: None,
        };
        assert!(projector.resolve_owner_email(&payload).await.is_err());
    }
}
