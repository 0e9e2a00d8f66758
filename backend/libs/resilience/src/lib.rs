//! Resilience primitives for calls to external dependencies.
//!
//! - **Circuit breaker**: per-dependency in-memory health gate that fails
//!   fast while a dependency is known bad.
//! - **Retry policy**: exponential backoff with full jitter, bounded by a
//!   dead-letter threshold. The computed delay is advisory; actual retry
//!   happens when the failed work is picked up again.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
};
pub use retry::RetryPolicy;
