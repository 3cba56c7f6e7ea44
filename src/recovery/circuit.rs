//! Circuit breakers keyed by external resource.
//!
//! A breaker trips to `Open` after `failure_threshold` consecutive failures
//! and rejects calls until `timeout` has passed since the last failure. It
//! then lets exactly one probe through (`HalfOpen`): success closes it,
//! failure reopens it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a caller should back off while a half-open probe is running.
pub const PROBE_RETRY_AFTER: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One probe call is allowed to test the resource.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub resource_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {resource}")]
    CircuitOpen {
        resource: String,
        retry_after: Duration,
    },

    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Inner {
    fn note_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    resource_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission to call through a breaker. Dropping a probe admission without
/// recording an outcome frees the probe slot again.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(resource_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let resource_id = resource_id.into();
        debug!(
            resource = %resource_id,
            failure_threshold = config.failure_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            "circuit breaker created"
        );
        Self {
            resource_id,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            resource_id: self.resource_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Rejected calls never invoke `op`. Any `Err` from `op` counts as a
    /// failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().map_err(|retry_after| CircuitBreakerError::CircuitOpen {
            resource: self.resource_id.clone(),
            retry_after,
        })?;

        let result = op().await;
        match &result {
            Ok(_) => self.on_success(admission.probe),
            Err(_) => self.on_failure(admission.probe),
        }
        drop(admission);

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Decide whether a call may proceed. `Err` carries the time until the
    /// breaker may admit a call again.
    fn admit(&self) -> Result<Admission<'_>, Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                breaker: self,
                probe: false,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.timeout);
                if elapsed < self.config.timeout {
                    return Err(self.config.timeout - elapsed);
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(resource = %self.resource_id, "circuit half-open, probing");
                Ok(Admission {
                    breaker: self,
                    probe: true,
                })
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(PROBE_RETRY_AFTER);
                }
                inner.probe_in_flight = true;
                Ok(Admission {
                    breaker: self,
                    probe: true,
                })
            }
        }
    }

    /// Record the outcome of a call made outside `call`. It counts as a
    /// regular call, never as the half-open probe.
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// See [`CircuitBreaker::record_success`].
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    /// While the circuit is not closed only the probe's outcome counts.
    /// Calls admitted before the circuit tripped finish as stale.
    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        match (inner.state, probe) {
            (CircuitState::Closed, _) => inner.consecutive_failures = 0,
            (CircuitState::HalfOpen, true) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                info!(resource = %self.resource_id, "circuit closed");
            }
            (state, _) => {
                debug!(resource = %self.resource_id, state = %state, "ignoring stale success");
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        match (inner.state, probe) {
            (CircuitState::Closed, _) => {
                inner.note_failure();
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        resource = %self.resource_id,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.note_failure();
                inner.state = CircuitState::Open;
                inner.probe_in_flight = false;
                warn!(resource = %self.resource_id, "probe failed, circuit reopened");
            }
            (state, _) => {
                debug!(resource = %self.resource_id, state = %state, "ignoring stale failure");
            }
        }
    }
}

/// Lazily created breakers, one per resource id.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for `resource`, created on first use.
    pub fn get(&self, resource: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(resource, self.config)))
            .clone()
    }

    /// Drop a breaker; the next `get` starts from `Closed`.
    pub fn evict(&self, resource: &str) -> bool {
        self.breakers.lock().remove(resource).is_some()
    }

    /// Snapshot of every breaker, ordered by resource id.
    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut states: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        states
    }

    pub fn len(&self) -> usize {
        self.breakers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.lock().is_empty()
    }
}
