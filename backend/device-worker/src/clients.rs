//! HTTP clients for the worker's external collaborators.
//!
//! Each collaborator sits behind a trait so the saga and dispatcher can
//! be exercised without a network. The production implementations share
//! one `reqwest` client carrying the configured timeouts, so no external
//! call can block shutdown indefinitely.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::WorkerConfig;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status} from {endpoint}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },
}

/// Resolve a user's email through the tenancy service.
#[async_trait]
pub trait TenancyApi: Send + Sync {
    /// `Ok(None)` when the service answers non-200 or knows no email;
    /// `Err` only for transport failures.
    async fn resolve_user_email(&self, user_id: &str) -> Result<Option<String>, ClientError>;
}

/// Outbound email delivery.
#[async_trait]
pub trait EmailApi: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), ClientError>;
}

/// Command calls back into the device service (saga compensation).
#[async_trait]
pub trait DeviceControlApi: Send + Sync {
    async fn activate_device(
        &self,
        tenant_id: Uuid,
        device_id: &str,
        reason: &str,
    ) -> Result<(), ClientError>;
}

/// Shared outbound HTTP client with the configured timeouts.
pub fn build_http_client(config: &WorkerConfig) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(config.http_timeout)
        .connect_timeout(config.http_connect_timeout)
        .build()
}

pub struct HttpTenancyClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTenancyClient {
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct UserEmailResponse {
    #[serde(default)]
    email: Option<String>,
}

#[async_trait]
impl TenancyApi for HttpTenancyClient {
    async fn resolve_user_email(&self, user_id: &str) -> Result<Option<String>, ClientError> {
        let url = format!("{}/internal/user-email/{}", self.base_url, user_id);
        let response = self
            .http
            .get(url)
            .header("x-internal-token", &self.token)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Ok(None);
        }

        let body: UserEmailResponse = response.json().await.unwrap_or_default();
        Ok(body.email.filter(|e| !e.is_empty()))
    }
}

pub struct ResendEmailClient {
    http: reqwest::Client,
    api_key: String,
    from: String,
}

impl ResendEmailClient {
    pub fn new(http: reqwest::Client, api_key: String, from: String) -> Self {
        Self {
            http,
            api_key,
            from,
        }
    }
}

#[async_trait]
impl EmailApi for ResendEmailClient {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Status {
                endpoint: "resend",
                status: response.status(),
            });
        }
        Ok(())
    }
}

pub struct HttpDeviceControlClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpDeviceControlClient {
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }
}

#[async_trait]
impl DeviceControlApi for HttpDeviceControlClient {
    async fn activate_device(
        &self,
        tenant_id: Uuid,
        device_id: &str,
        reason: &str,
    ) -> Result<(), ClientError> {
        let url = format!(
            "{}/api/v1/devices/{}/activate",
            self.base_url,
            urlencoding::encode(device_id)
        );
        let response = self
            .http
            .post(url)
            .header("x-user-id", "system")
            .header("x-tenant-id", tenant_id.to_string())
            .header("x-internal-token", &self.token)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::Status {
                endpoint: "device-service",
                status: response.status(),
            });
        }
        Ok(())
    }
}
