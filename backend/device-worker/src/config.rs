//! Worker configuration, loaded from environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use resilience::{CircuitBreakerConfig, RetryPolicy};

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,

    /// Resend API key for outbound email
    pub resend_api_key: String,
    /// Sender address for outbound email
    pub resend_from: String,

    pub tenancy_service_url: String,
    pub tenancy_service_token: String,

    pub device_service_url: String,
    pub device_service_token: String,

    /// Sleep between polling iterations
    pub poll_interval: Duration,

    /// Total timeout for outbound HTTP calls
    pub http_timeout: Duration,
    /// Connect timeout for outbound HTTP calls
    pub http_connect_timeout: Duration,

    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            resend_api_key: required("RESEND_API_KEY")?,
            resend_from: required("RESEND_FROM")?,
            tenancy_service_url: required("TENANCY_SERVICE_URL")?,
            tenancy_service_token: required("TENANCY_SERVICE_TOKEN")?,
            device_service_url: required("DEVICE_SERVICE_URL")?,
            device_service_token: required("DEVICE_SERVICE_TOKEN")?,
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECONDS", 5u64)),
            http_timeout: Duration::from_secs_f64(env_parse("HTTP_TIMEOUT", 10.0)),
            http_connect_timeout: Duration::from_secs_f64(env_parse("HTTP_CONNECT_TIMEOUT", 5.0)),
            retry: RetryPolicy {
                base_delay: Duration::from_secs_f64(env_parse("RETRY_BASE_DELAY", 1.0)),
                max_delay: Duration::from_secs_f64(env_parse("RETRY_MAX_DELAY", 60.0)),
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 5u32),
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env_parse("CB_FAILURE_THRESHOLD", 5u32),
                recovery_timeout: Duration::from_secs_f64(env_parse("CB_RECOVERY_TIMEOUT", 30.0)),
            },
        })
    }
}

fn required(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("missing required environment variable {var}"))
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
