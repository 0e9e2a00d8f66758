//! DeviceRetirementSaga: notification with compensation.
//!
//! Retiring a device must be followed by a user notification; if the
//! notification definitively cannot be sent, the retirement is reversed
//! through the device service. Saga state is persisted on every
//! transition so an interrupted saga stays diagnosable; there is no
//! automatic resumption.
//!
//! ```text
//!     running ── notify OK ──────▶ completed
//!        │
//!        │ notify fails
//!        ▼
//!  compensating ── reactivate OK ─▶ compensated
//!        │
//!        │ reactivate fails
//!        ▼
//!      failed
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_pool::DbSession;
use resilience::CircuitBreaker;
use tracing::{error, info, warn};
use transactional_outbox::truncate_error;
use uuid::Uuid;

use crate::clients::{DeviceControlApi, EmailApi, TenancyApi};
use crate::dispatch::DispatchError;

pub const DEVICE_RETIREMENT_SAGA: &str = "device.retirement";

pub const STEP_NOTIFY: &str = "notify";
pub const STEP_REACTIVATE: &str = "reactivate";
pub const STEP_DONE: &str = "done";

/// Saga lifecycle. Transitions are monotonic; terminal states are
/// `Completed`, `Compensated`, and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Running,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

impl SagaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::Failed => "failed",
        }
    }
}

/// A row in the `saga_state` table.
#[derive(Debug, Clone)]
pub struct SagaState {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub saga_type: String,
    pub status: SagaStatus,
    pub current_step: String,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable saga-state persistence. Writes ride the caller's session, so
/// they commit together with the outbox row updates of the same batch.
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    async fn insert(&self, session: &DbSession, state: &SagaState) -> anyhow::Result<()>;

    async fn update_status(
        &self,
        session: &DbSession,
        saga_id: Uuid,
        status: SagaStatus,
        step: &str,
        error: Option<&str>,
    ) -> anyhow::Result<()>;
}

pub struct SqlxSagaStateStore;

#[async_trait]
impl SagaStateStore for SqlxSagaStateStore {
    async fn insert(&self, session: &DbSession, state: &SagaState) -> anyhow::Result<()> {
        let mut conn = session.acquire().await;
        sqlx::query(
            r#"
            INSERT INTO saga_state (id, tenant_id, saga_type, status, current_step, payload, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(state.id)
        .bind(state.tenant_id)
        .bind(&state.saga_type)
        .bind(state.status.as_str())
        .bind(&state.current_step)
        .bind(&state.payload)
        .bind(&state.error)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(conn.conn()?)
        .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        session: &DbSession,
        saga_id: Uuid,
        status: SagaStatus,
        step: &str,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut conn = session.acquire().await;
        sqlx::query(
            r#"
            UPDATE saga_state
            SET status = $2, current_step = $3, error = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(saga_id)
        .bind(status.as_str())
        .bind(step)
        .bind(error)
        .bind(Utc::now())
        .execute(conn.conn()?)
        .await?;
        Ok(())
    }
}

/// In-memory saga store recording the full status history per saga.
#[derive(Clone, Default)]
pub struct InMemorySagaStateStore {
    sagas: Arc<parking_lot::Mutex<Vec<SagaRecord>>>,
}

#[derive(Debug, Clone)]
pub struct SagaRecord {
    pub state: SagaState,
    pub history: Vec<SagaStatus>,
}

impl InMemorySagaStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SagaRecord> {
        self.sagas.lock().clone()
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStateStore {
    async fn insert(&self, _session: &DbSession, state: &SagaState) -> anyhow::Result<()> {
        self.sagas.lock().push(SagaRecord {
            state: state.clone(),
            history: vec![state.status],
        });
        Ok(())
    }

    async fn update_status(
        &self,
        _session: &DbSession,
        saga_id: Uuid,
        status: SagaStatus,
        step: &str,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut sagas = self.sagas.lock();
        let record = sagas
            .iter_mut()
            .find(|r| r.state.id == saga_id)
            .ok_or_else(|| anyhow::anyhow!("saga {saga_id} not found"))?;
        record.state.status = status;
        record.state.current_step = step.to_string();
        record.state.error = error.map(str::to_string);
        record.state.updated_at = Utc::now();
        record.history.push(status);
        Ok(())
    }
}

/// Escape HTML special characters for user-facing email content.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub struct DeviceRetirementSaga<S> {
    store: S,
    tenancy: Arc<dyn TenancyApi>,
    email: Arc<dyn EmailApi>,
    device_control: Arc<dyn DeviceControlApi>,
    tenancy_breaker: CircuitBreaker,
    email_breaker: CircuitBreaker,
}

impl<S: SagaStateStore> DeviceRetirementSaga<S> {
    pub fn new(
        store: S,
        tenancy: Arc<dyn TenancyApi>,
        email: Arc<dyn EmailApi>,
        device_control: Arc<dyn DeviceControlApi>,
        tenancy_breaker: CircuitBreaker,
        email_breaker: CircuitBreaker,
    ) -> Self {
        Self {
            store,
            tenancy,
            email,
            device_control,
            tenancy_breaker,
            email_breaker,
        }
    }

    /// Run the saga to a terminal state. Step failures are absorbed into
    /// the persisted state; only saga-state persistence errors propagate
    /// (the poller treats those as transient).
    pub async fn start(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        device_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<(), DispatchError> {
        let saga_id = Uuid::new_v4();
        let now = Utc::now();
        let state = SagaState {
            id: saga_id,
            tenant_id,
            saga_type: DEVICE_RETIREMENT_SAGA.to_string(),
            status: SagaStatus::Running,
            current_step: STEP_NOTIFY.to_string(),
            payload: serde_json::json!({
                "device_id": device_id,
                "user_id": user_id,
                "reason": reason,
            }),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(session, &state).await?;

        info!(saga_id = %saga_id, device_id, "saga starting notify step");
        match self.notify(device_id, user_id, reason).await {
            Ok(()) => {
                self.store
                    .update_status(session, saga_id, SagaStatus::Completed, STEP_DONE, None)
                    .await?;
                info!(saga_id = %saga_id, "saga completed");
            }
            Err(err) => {
                warn!(saga_id = %saga_id, error = %err, "notify step failed, compensating");
                self.store
                    .update_status(
                        session,
                        saga_id,
                        SagaStatus::Compensating,
                        STEP_REACTIVATE,
                        Some(&truncate_error(&err.to_string())),
                    )
                    .await?;

                match self.reactivate(tenant_id, device_id, reason).await {
                    Ok(()) => {
                        self.store
                            .update_status(session, saga_id, SagaStatus::Compensated, STEP_DONE, None)
                            .await?;
                        info!(saga_id = %saga_id, "saga compensated, device reactivated");
                    }
                    Err(comp_err) => {
                        error!(saga_id = %saga_id, error = %comp_err, "saga compensation failed");
                        self.store
                            .update_status(
                                session,
                                saga_id,
                                SagaStatus::Failed,
                                STEP_REACTIVATE,
                                Some(&truncate_error(&comp_err.to_string())),
                            )
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Notify step: resolve the user's email and send the retirement
    /// notice. Any failure fails the step, an open breaker included.
    async fn notify(&self, device_id: &str, user_id: &str, reason: &str) -> anyhow::Result<()> {
        let email = self
            .tenancy_breaker
            .call(|| async {
                match self.tenancy.resolve_user_email(user_id).await {
                    Ok(Some(email)) => Ok(email),
                    Ok(None) => Err(anyhow::anyhow!("no email found for user {user_id}")),
                    Err(err) => Err(anyhow::Error::new(err)),
                }
            })
            .await?;

        let reason_text = if reason.trim().is_empty() {
            "No reason provided"
        } else {
            reason
        };
        let html = format!(
            "<p>Device <code>{}</code> was retired.</p><p>Reason: {}</p>",
            html_escape(device_id),
            html_escape(reason_text),
        );

        self.email_breaker
            .call(|| self.email.send(&email, "Device retired", &html))
            .await?;
        Ok(())
    }

    /// Compensation step: reverse the retirement through the device
    /// service, authenticated as the system identity.
    async fn reactivate(
        &self,
        tenant_id: Uuid,
        device_id: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        let compensation_reason = format!(
            "Saga compensation: notification failed after retirement (original reason: {reason})"
        );
        self.device_control
            .activate_device(tenant_id, device_id, &compensation_reason)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{MockDeviceControl, MockEmail, MockTenancy, TenancyBehavior};
    use resilience::CircuitBreakerConfig;

    struct Harness {
        saga: DeviceRetirementSaga<InMemorySagaStateStore>,
        store: InMemorySagaStateStore,
        email: MockEmail,
        device_control: MockDeviceControl,
        tenancy_breaker: CircuitBreaker,
    }

    fn harness(tenancy: TenancyBehavior, email_fails: bool, device_fails: bool) -> Harness {
        let store = InMemorySagaStateStore::new();
        let email = MockEmail {
            fail: email_fails,
            ..Default::default()
        };
        let device_control = MockDeviceControl {
            fail: device_fails,
            ..Default::default()
        };
        let tenancy_breaker = CircuitBreaker::new("tenancy", CircuitBreakerConfig::default());
        let email_breaker = CircuitBreaker::new("resend", CircuitBreakerConfig::default());
        let saga = DeviceRetirementSaga::new(
            store.clone(),
            Arc::new(MockTenancy::with(tenancy)),
            Arc::new(email.clone()),
            Arc::new(device_control.clone()),
            tenancy_breaker.clone(),
            email_breaker,
        );
        Harness {
            saga,
            store,
            email,
            device_control,
            tenancy_breaker,
        }
    }

    async fn run(h: &Harness) {
        h.saga
            .start(
                &DbSession::detached(),
                Uuid::new_v4(),
                "device-1",
                "user-1",
                "End of life",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn happy_path_completes_and_sends_one_email() {
        let h = harness(
            TenancyBehavior::Email("u@example.com".into()),
            false,
            false,
        );
        run(&h).await;

        let records = h.store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].history,
            vec![SagaStatus::Running, SagaStatus::Completed]
        );
        assert_eq!(records[0].state.current_step, STEP_DONE);
        assert!(records[0].state.error.is_none());

        let sent = h.email.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "u@example.com");
        assert_eq!(sent[0].1, "Device retired");
        assert!(h.device_control.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn notify_failure_triggers_compensation() {
        let h = harness(TenancyBehavior::Fail, false, false);
        run(&h).await;

        let records = h.store.records();
        assert_eq!(
            records[0].history,
            vec![
                SagaStatus::Running,
                SagaStatus::Compensating,
                SagaStatus::Compensated
            ]
        );

        let calls = h.device_control.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "device-1");
        assert!(calls[0].2.starts_with("Saga compensation:"));
        assert!(calls[0].2.contains("End of life"));
    }

    #[tokio::test]
    async fn missing_email_is_a_notify_failure() {
        let h = harness(TenancyBehavior::NoEmail, false, false);
        run(&h).await;

        let records = h.store.records();
        assert_eq!(records[0].state.status, SagaStatus::Compensated);
        assert!(h.email.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn email_send_failure_triggers_compensation() {
        let h = harness(
            TenancyBehavior::Email("u@example.com".into()),
            true,
            false,
        );
        run(&h).await;

        let records = h.store.records();
        assert_eq!(records[0].state.status, SagaStatus::Compensated);
        assert_eq!(h.device_control.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn compensation_failure_ends_failed_with_error_recorded() {
        let h = harness(TenancyBehavior::Fail, false, true);
        run(&h).await;

        let records = h.store.records();
        assert_eq!(
            records[0].history,
            vec![
                SagaStatus::Running,
                SagaStatus::Compensating,
                SagaStatus::Failed
            ]
        );
        assert_eq!(records[0].state.current_step, STEP_REACTIVATE);
        assert!(records[0].state.error.is_some());
    }

    #[tokio::test]
    async fn open_breaker_during_notify_compensates() {
        let h = harness(
            TenancyBehavior::Email("u@example.com".into()),
            false,
            false,
        );
        // Trip the shared tenancy breaker before the saga runs.
        for _ in 0..5 {
            let _ = h
                .tenancy_breaker
                .call(|| async { Err::<(), _>("down") })
                .await;
        }
        run(&h).await;

        let records = h.store.records();
        assert_eq!(records[0].state.status, SagaStatus::Compensated);
        assert!(h.email.sent.lock().is_empty());
        assert_eq!(h.device_control.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn status_histories_follow_the_state_machine() {
        let valid: [&[SagaStatus]; 3] = [
            &[SagaStatus::Running, SagaStatus::Completed],
            &[
                SagaStatus::Running,
                SagaStatus::Compensating,
                SagaStatus::Compensated,
            ],
            &[
                SagaStatus::Running,
                SagaStatus::Compensating,
                SagaStatus::Failed,
            ],
        ];

        for (behavior, device_fails) in [
            (TenancyBehavior::Email("u@example.com".into()), false),
            (TenancyBehavior::Fail, false),
            (TenancyBehavior::Fail, true),
        ] {
            let h = harness(behavior, false, device_fails);
            run(&h).await;
            let history = h.store.records()[0].history.clone();
            assert!(
                valid.iter().any(|path| *path == history.as_slice()),
                "unexpected status sequence {history:?}"
            );
        }
    }

    #[tokio::test]
    async fn saga_error_strings_are_truncated() {
        let h = harness(TenancyBehavior::Fail, false, true);
        run(&h).await;
        let records = h.store.records();
        let error = records[0].state.error.clone().unwrap();
        assert!(error.len() <= transactional_outbox::MAX_LAST_ERROR_LEN);
    }

    #[test]
    fn html_escape_escapes_special_chars() {
        assert_eq!(html_escape("<script>"), "&lt;script&gt;");
        assert_eq!(html_escape("a & b \"c\""), "a &amp; b &quot;c&quot;");
    }

    #[tokio::test]
    async fn email_body_escapes_device_id_and_reason() {
        let h = harness(
            TenancyBehavior::Email("u@example.com".into()),
            false,
            false,
        );
        h.saga
            .start(
                &DbSession::detached(),
                Uuid::new_v4(),
                "<dev&1>",
                "user-1",
                "broken <screen>",
            )
            .await
            .unwrap();

        let sent = h.email.sent.lock();
        assert!(sent[0].2.contains("&lt;dev&amp;1&gt;"));
        assert!(sent[0].2.contains("broken &lt;screen&gt;"));
        assert!(!sent[0].2.contains("<dev"));
    }
}
