//! Failure recovery: retry policies and circuit breakers.
//!
//! The two layers compose. A breaker can reject an attempt before it runs,
//! without touching the task's retry budget; a failed attempt that did run
//! is handed to the policy, which decides between retry, compensation and
//! failure.

mod circuit;
mod policy;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitState, PROBE_RETRY_AFTER,
};
pub use policy::{
    ActionKind, ErrorKind, FixedJitter, Jitter, RandomJitter, RecoveryAction, RecoveryAttempt,
    RecoveryManager, RecoveryPolicy, RecoveryStrategy, RecoveryTracker, DEFAULT_STRATEGY,
    JITTER_RATIO, MAX_BACKOFF, MIN_BACKOFF,
};
