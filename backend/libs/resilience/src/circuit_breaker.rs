/// Circuit breaker with fail-fast behaviour per external dependency.
///
/// State transitions:
/// - Closed → Open: consecutive failures reach `failure_threshold`
/// - Open → HalfOpen: `recovery_timeout` elapsed since the last failure
/// - HalfOpen → Closed: the probe call succeeds
/// - HalfOpen → Open: the probe call fails
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Testing if the dependency recovered, next request is attempted
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count to trigger circuit open
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit '{0}' is open, failing fast")]
    Open(String),
    #[error("call failed: {0}")]
    CallFailed(String),
}

struct BreakerState {
    current: CircuitState,
    failure_count: u32,
    /// Monotonic timestamp of the most recent failure; system clock
    /// jumps cannot close the circuit early.
    last_failure_at: Option<Instant>,
}

/// Cloneable handle; clones share the same state, so every call site
/// sees one health picture per dependency.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into().into(),
            config,
            state: Arc::new(RwLock::new(BreakerState {
                current: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; querying an open circuit whose recovery timeout has
    /// elapsed transitions it to half-open.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.write();
        if state.current == CircuitState::Open {
            let elapsed = state
                .last_failure_at
                .map(|at| at.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true);
            if elapsed {
                info!(circuit = %self.name, "circuit breaker: open -> half-open");
                state.current = CircuitState::HalfOpen;
            }
        }
        state.current
    }

    /// Execute a future through the breaker.
    ///
    /// Returns [`CircuitBreakerError::Open`] without invoking `f` while
    /// the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if self.state() == CircuitState::Open {
            return Err(CircuitBreakerError::Open(self.name.to_string()));
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::CallFailed(e.to_string()))
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.write();
        if state.current == CircuitState::HalfOpen {
            info!(circuit = %self.name, "circuit breaker: half-open -> closed");
        }
        state.current = CircuitState::Closed;
        state.failure_count = 0;
    }

    fn record_failure(&self) {
        let mut state = self.state.write();
        state.failure_count += 1;
        state.last_failure_at = Some(Instant::now());

        match state.current {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        circuit = %self.name,
                        failures = state.failure_count,
                        "circuit breaker: closed -> open"
                    );
                    state.current = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(circuit = %self.name, "circuit breaker: half-open -> open (probe failed)");
                state.current = CircuitState::Open;
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
            },
        )
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = breaker(3, Duration::from_secs(10));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let cb = breaker(2, Duration::from_secs(10));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        }

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_invoking_call() {
        let cb = breaker(1, Duration::from_secs(999));
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;

        let invocations = Arc::new(AtomicU32::new(0));
        let counter = invocations.clone();
        let result = cb
            .call(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(10));

        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        }
        cb.call(|| async { Ok::<_, String>(()) }).await.unwrap();
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        }

        // Two failures after a reset stay below the threshold of three.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout() {
        let cb = breaker(1, Duration::from_millis(0));
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;

        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes() {
        let cb = breaker(1, Duration::from_millis(0));
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;

        cb.call(|| async { Ok::<_, String>(()) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(50));
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let cb = breaker(1, Duration::from_secs(999));
        let other = cb.clone();
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;

        assert_eq!(other.state(), CircuitState::Open);
    }
}
