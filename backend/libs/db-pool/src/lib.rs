//! Database connection pool management
//!
//! Provides unified pool creation for both services and the
//! transaction-scoped [`DbSession`] handle that lets every repository
//! participating in one request (or one poll iteration) run against the
//! same database transaction.

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, Transaction};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Database connection pool configuration
#[derive(Clone)]
pub struct DbConfig {
    /// Service name for log labeling
    pub service_name: String,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection creation timeout (new connection to PostgreSQL)
    pub connect_timeout_secs: u64,
    /// Connection acquisition timeout (get connection from pool)
    pub acquire_timeout_secs: u64,
    /// Connection idle timeout
    pub idle_timeout_secs: u64,
    /// Connection maximum lifetime
    pub max_lifetime_secs: u64,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("service_name", &self.service_name)
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .finish()
    }
}

impl DbConfig {
    /// Build a config for the given service from `DATABASE_URL` plus the
    /// optional `DB_*` override variables.
    pub fn from_env(service_name: &str, database_url: String) -> Self {
        Self {
            service_name: service_name.to_string(),
            database_url,
            max_connections: env_parse("DB_MAX_CONNECTIONS", 10),
            min_connections: env_parse("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: env_parse("DB_CONNECT_TIMEOUT_SECS", 5),
            acquire_timeout_secs: env_parse("DB_ACQUIRE_TIMEOUT_SECS", 30),
            idle_timeout_secs: env_parse("DB_IDLE_TIMEOUT_SECS", 600),
            max_lifetime_secs: env_parse("DB_MAX_LIFETIME_SECS", 1800),
        }
    }

    /// Log pool configuration details
    pub fn log_config(&self) {
        info!(
            service = %self.service_name,
            max_connections = self.max_connections,
            min_connections = self.min_connections,
            connect_timeout_secs = self.connect_timeout_secs,
            acquire_timeout_secs = self.acquire_timeout_secs,
            idle_timeout_secs = self.idle_timeout_secs,
            max_lifetime_secs = self.max_lifetime_secs,
            "database pool configuration"
        );
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Create a PostgreSQL connection pool with bounded size and pre-ping.
///
/// Connections are verified before being handed out
/// (`test_before_acquire`), and the pool is probed once with `SELECT 1`
/// so misconfiguration fails at startup instead of on first request.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool, sqlx::Error> {
    debug!(service = %config.service_name, "creating database pool");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect_lazy(&config.database_url)?;

    tokio::time::timeout(
        Duration::from_secs(config.connect_timeout_secs),
        sqlx::query("SELECT 1").execute(&pool),
    )
    .await
    .map_err(|_| sqlx::Error::PoolTimedOut)??;

    info!(service = %config.service_name, "database pool created and verified");
    Ok(pool)
}

/// Errors raised when using a [`DbSession`] outside its valid lifetime.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session holds no live transaction (already committed, rolled
    /// back, or created detached).
    #[error("database session is not active")]
    NotActive,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

enum SessionState {
    Active(Transaction<'static, Postgres>),
    Detached,
    Closed,
}

/// A cloneable handle over one database transaction.
///
/// Every repository taking part in a unit of work holds a clone of the
/// session, so an aggregate write and its outbox append (or a claimed
/// outbox batch and its saga-state updates) commit atomically. Dropping
/// the session without committing rolls the transaction back.
///
/// A detached session carries no transaction at all; it exists so that
/// in-memory trait implementations can run under the same signatures in
/// tests. Routing SQL through a detached session fails with
/// [`SessionError::NotActive`].
#[derive(Clone)]
pub struct DbSession {
    inner: Arc<Mutex<SessionState>>,
}

impl DbSession {
    /// Open a new transaction-backed session from the pool.
    pub async fn begin(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let tx = pool.begin().await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(SessionState::Active(tx))),
        })
    }

    /// Create a session with no backing transaction.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionState::Detached)),
        }
    }

    /// Lock the session for use; the guard exposes the transaction's
    /// connection for the duration of one statement sequence.
    pub async fn acquire(&self) -> SessionConn<'_> {
        SessionConn(self.inner.lock().await)
    }

    /// Commit the underlying transaction. The session is unusable
    /// afterwards; further commits or SQL fail with `NotActive`.
    pub async fn commit(&self) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        match std::mem::replace(&mut *guard, SessionState::Closed) {
            SessionState::Active(tx) => {
                tx.commit().await?;
                Ok(())
            }
            SessionState::Detached => Ok(()),
            SessionState::Closed => Err(SessionError::NotActive),
        }
    }

    /// Roll the underlying transaction back explicitly. Dropping the
    /// session has the same effect; this variant surfaces errors.
    pub async fn rollback(&self) -> Result<(), SessionError> {
        let mut guard = self.inner.lock().await;
        match std::mem::replace(&mut *guard, SessionState::Closed) {
            SessionState::Active(tx) => {
                tx.rollback().await?;
                Ok(())
            }
            SessionState::Detached => Ok(()),
            SessionState::Closed => Err(SessionError::NotActive),
        }
    }
}

/// Guard over a locked [`DbSession`].
pub struct SessionConn<'a>(MutexGuard<'a, SessionState>);

impl SessionConn<'_> {
    /// The live connection, or `NotActive` when the session is detached
    /// or already finished.
    pub fn conn(&mut self) -> Result<&mut PgConnection, SessionError> {
        match &mut *self.0 {
            SessionState::Active(tx) => Ok(&mut **tx),
            _ => Err(SessionError::NotActive),
        }
    }
}

/// Where the worker gets its per-iteration sessions from.
pub enum SessionSource {
    Pool(PgPool),
    /// Detached sessions for in-memory test harnesses.
    Detached,
}

impl SessionSource {
    pub async fn open(&self) -> Result<DbSession, sqlx::Error> {
        match self {
            SessionSource::Pool(pool) => DbSession::begin(pool).await,
            SessionSource::Detached => Ok(DbSession::detached()),
        }
    }
}
