//! Recovery decisions for failed task attempts.
//!
//! `RecoveryPolicy::evaluate` is a pure decision function: it classifies the
//! error, checks the strategy registered for the task kind, and returns
//! whether to retry (with a backoff delay), compensate, or fail. Attempt
//! history is kept by the caller, usually through a `RecoveryManager`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::task::{Task, TaskError, TaskId};

/// Symmetric jitter applied to every backoff delay (±30%).
pub const JITTER_RATIO: f64 = 0.3;

/// No retry is scheduled sooner than this.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// No retry is scheduled later than this, whatever the strategy's cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Strategy name used when no kind-specific entry exists.
pub const DEFAULT_STRATEGY: &str = "default";

/// Coarse classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    RateLimit,
    Deadlock,
    Dns,
    ServerError,
    Unknown,
}

/// Message patterns in match order. More specific kinds come first, so
/// "lock wait timeout" is a deadlock rather than a timeout.
static PATTERNS: LazyLock<Vec<(ErrorKind, Regex)>> = LazyLock::new(|| {
    vec![
        (
            ErrorKind::RateLimit,
            Regex::new(r"(?i)rate[ _-]?limit|too many requests|\b429\b|quota exceeded|throttl").unwrap(),
        ),
        (
            ErrorKind::Deadlock,
            Regex::new(r"(?i)deadlock|lock wait timeout|serialization failure").unwrap(),
        ),
        (
            ErrorKind::Dns,
            Regex::new(r"(?i)\bdns\b|name resolution|could not resolve|nxdomain|no such host|getaddrinfo").unwrap(),
        ),
        (
            ErrorKind::Timeout,
            Regex::new(r"(?i)time[ _-]?out|timed out|deadline exceeded").unwrap(),
        ),
        (
            ErrorKind::Connection,
            Regex::new(r"(?i)connection (refused|reset|closed|aborted|error|failed)|broken pipe|econnrefused|econnreset|network is unreachable").unwrap(),
        ),
        (
            ErrorKind::ServerError,
            Regex::new(r"(?i)\b5\d\d\b|internal server error|service unavailable|bad gateway|server error").unwrap(),
        ),
    ]
});

impl ErrorKind {
    /// Classify a backend error, preferring its kind tag over the message.
    pub fn classify(error: &TaskError) -> Self {
        if let Some(tag) = error.kind.as_deref() {
            if let Some(kind) = Self::from_tag(tag) {
                return kind;
            }
            let from_tag = Self::from_message(tag);
            if from_tag != ErrorKind::Unknown {
                return from_tag;
            }
        }
        Self::from_message(&error.message)
    }

    fn from_tag(tag: &str) -> Option<Self> {
        let normalized = tag.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "timeout" | "timed_out" | "deadline_exceeded" => Some(ErrorKind::Timeout),
            "connection" | "connection_error" => Some(ErrorKind::Connection),
            "rate_limit" | "rate_limited" | "too_many_requests" => Some(ErrorKind::RateLimit),
            "deadlock" => Some(ErrorKind::Deadlock),
            "dns" => Some(ErrorKind::Dns),
            "server_error" | "internal" => Some(ErrorKind::ServerError),
            "unknown" => Some(ErrorKind::Unknown),
            _ => None,
        }
    }

    fn from_message(message: &str) -> Self {
        PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(message))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Connection => write!(f, "connection"),
            ErrorKind::RateLimit => write!(f, "rate_limit"),
            ErrorKind::Deadlock => write!(f, "deadlock"),
            ErrorKind::Dns => write!(f, "dns"),
            ErrorKind::ServerError => write!(f, "server_error"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Retry parameters for one task kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryStrategy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub max_backoff_secs: f64,
    pub retryable_error_kinds: BTreeSet<ErrorKind>,
    /// Non-retryable kinds that trigger compensation instead of failure.
    pub compensate_on: BTreeSet<ErrorKind>,
    /// Compensate rather than fail once the retry budget is spent.
    pub compensate_on_exhaustion: bool,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff_secs: 60.0,
            retryable_error_kinds: BTreeSet::from([
                ErrorKind::Timeout,
                ErrorKind::Connection,
                ErrorKind::RateLimit,
                ErrorKind::Deadlock,
                ErrorKind::Dns,
                ErrorKind::ServerError,
            ]),
            compensate_on: BTreeSet::new(),
            compensate_on_exhaustion: false,
        }
    }
}

impl RecoveryStrategy {
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            backoff_multiplier: 2.0,
            max_backoff_secs: 60.0,
            retryable_error_kinds: BTreeSet::from([
                ErrorKind::Timeout,
                ErrorKind::Connection,
                ErrorKind::Dns,
                ErrorKind::RateLimit,
                ErrorKind::ServerError,
            ]),
            ..Self::default()
        }
    }

    pub fn database() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 1.5,
            max_backoff_secs: 30.0,
            retryable_error_kinds: BTreeSet::from([
                ErrorKind::Timeout,
                ErrorKind::Connection,
                ErrorKind::Deadlock,
            ]),
            ..Self::default()
        }
    }

    pub fn ai_model() -> Self {
        Self {
            max_retries: 4,
            backoff_multiplier: 2.0,
            max_backoff_secs: 120.0,
            retryable_error_kinds: BTreeSet::from([
                ErrorKind::Timeout,
                ErrorKind::RateLimit,
                ErrorKind::ServerError,
                ErrorKind::Connection,
            ]),
            ..Self::default()
        }
    }

    pub fn resource() -> Self {
        Self {
            max_retries: 2,
            backoff_multiplier: 2.0,
            max_backoff_secs: 30.0,
            retryable_error_kinds: BTreeSet::from([
                ErrorKind::Timeout,
                ErrorKind::Connection,
                ErrorKind::RateLimit,
            ]),
            ..Self::default()
        }
    }

    /// Built-in per-kind strategies.
    pub fn builtin() -> HashMap<String, RecoveryStrategy> {
        HashMap::from([
            ("network".to_string(), Self::network()),
            ("database".to_string(), Self::database()),
            ("ai_model".to_string(), Self::ai_model()),
            ("resource".to_string(), Self::resource()),
        ])
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    /// Backoff before the retry that follows `attempts` recorded failures.
    ///
    /// `min(multiplier^attempts, max)` seconds, scaled by the jitter factor,
    /// kept within `[MIN_BACKOFF, MAX_BACKOFF]`.
    pub fn backoff(&self, attempts: u32, jitter_factor: f64) -> Duration {
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let base = self.backoff_multiplier.powi(exponent).min(self.max_backoff_secs);
        // f64::max drops a NaN operand
        let secs = (base * jitter_factor)
            .max(MIN_BACKOFF.as_secs_f64())
            .min(MAX_BACKOFF.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Whether the backoff parameters are usable: a finite multiplier of at
    /// least 1 and a positive cap no larger than [`MAX_BACKOFF`].
    pub fn has_valid_backoff(&self) -> bool {
        let multiplier = self.backoff_multiplier;
        let cap = self.max_backoff_secs;
        multiplier.is_finite()
            && multiplier >= 1.0
            && cap.is_finite()
            && cap > 0.0
            && cap <= MAX_BACKOFF.as_secs_f64()
    }
}

/// Source of the multiplicative jitter factor.
pub trait Jitter: Send + Sync + std::fmt::Debug {
    /// A factor within `[1 - JITTER_RATIO, 1 + JITTER_RATIO]`.
    fn factor(&self) -> f64;
}

/// Uniform random jitter.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn factor(&self) -> f64 {
        1.0 + rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO)
    }
}

/// Always returns the same factor, clamped into the jitter band.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl FixedJitter {
    pub fn none() -> Self {
        Self(1.0)
    }
}

impl Jitter for FixedJitter {
    fn factor(&self) -> f64 {
        self.0.clamp(1.0 - JITTER_RATIO, 1.0 + JITTER_RATIO)
    }
}

/// What the executor should do about a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Run the task again after `delay`.
    Retry { delay: Duration, reason: String },
    /// Stop retrying and run the backend's compensation hook.
    Compensate { reason: String },
    /// Give up on the task.
    Fail { reason: String },
}

impl RecoveryAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            RecoveryAction::Retry { .. } => ActionKind::Retry,
            RecoveryAction::Compensate { .. } => ActionKind::Compensate,
            RecoveryAction::Fail { .. } => ActionKind::Fail,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            RecoveryAction::Retry { reason, .. }
            | RecoveryAction::Compensate { reason }
            | RecoveryAction::Fail { reason } => reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Retry,
    Compensate,
    Fail,
}

/// One failure evaluation. Entries are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub task_id: TaskId,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub error_kind: ErrorKind,
    pub action: ActionKind,
}

/// Per-kind recovery strategies plus a default.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    default: RecoveryStrategy,
    strategies: HashMap<String, RecoveryStrategy>,
    jitter: Arc<dyn Jitter>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryPolicy {
    /// Policy with the built-in strategies and random jitter.
    pub fn new() -> Self {
        Self {
            default: RecoveryStrategy::default(),
            strategies: RecoveryStrategy::builtin(),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_default(mut self, strategy: RecoveryStrategy) -> Self {
        self.default = strategy;
        self
    }

    pub fn with_strategy(mut self, kind: &str, strategy: RecoveryStrategy) -> Self {
        self.strategies.insert(kind.to_string(), strategy);
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Strategy for a task kind, or the default.
    pub fn strategy_for(&self, kind: &str) -> &RecoveryStrategy {
        if kind == DEFAULT_STRATEGY {
            return &self.default;
        }
        self.strategies.get(kind).unwrap_or(&self.default)
    }

    /// Decide what to do about a failure of a task of `task_kind`.
    ///
    /// `history` holds the attempts already recorded for the task; the
    /// current failure is not in it yet.
    pub fn evaluate(
        &self,
        task_kind: &str,
        error: &TaskError,
        history: &[RecoveryAttempt],
    ) -> RecoveryAction {
        self.evaluate_with_budget(task_kind, None, error, history)
    }

    /// Like `evaluate`, with an optional per-task retry budget override.
    pub fn evaluate_with_budget(
        &self,
        task_kind: &str,
        max_retries: Option<u32>,
        error: &TaskError,
        history: &[RecoveryAttempt],
    ) -> RecoveryAction {
        let strategy = self.strategy_for(task_kind);
        let kind = ErrorKind::classify(error);
        let max_retries = max_retries.unwrap_or(strategy.max_retries);

        if !strategy.is_retryable(kind) {
            let reason = format!("{} errors are not retryable", kind);
            if strategy.compensate_on.contains(&kind) {
                return RecoveryAction::Compensate { reason };
            }
            return RecoveryAction::Fail { reason };
        }

        let attempts = history.len() as u32;
        if attempts >= max_retries {
            let reason = "max retries exceeded".to_string();
            if strategy.compensate_on_exhaustion {
                return RecoveryAction::Compensate { reason };
            }
            return RecoveryAction::Fail { reason };
        }

        RecoveryAction::Retry {
            delay: strategy.backoff(attempts, self.jitter.factor()),
            reason: format!("{} error, retry {} of {}", kind, attempts + 1, max_retries),
        }
    }
}

/// Tracks recovery attempts per task.
///
/// # Example
///
/// ```
/// use maestro::recovery::{ActionKind, ErrorKind, RecoveryAttempt, RecoveryTracker};
/// use maestro::core::TaskId;
///
/// let mut tracker = RecoveryTracker::new();
/// let task_id = TaskId::from("fetch");
///
/// assert_eq!(tracker.attempts(&task_id), 0);
/// tracker.record(RecoveryAttempt {
///     task_id: task_id.clone(),
///     attempt_number: 1,
///     timestamp: chrono::Utc::now(),
///     error_kind: ErrorKind::Timeout,
///     action: ActionKind::Retry,
/// });
/// assert_eq!(tracker.attempts(&task_id), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RecoveryTracker {
    history: HashMap<TaskId, Vec<RecoveryAttempt>>,
}

impl RecoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, task_id: &TaskId) -> &[RecoveryAttempt] {
        self.history.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn attempts(&self, task_id: &TaskId) -> usize {
        self.history(task_id).len()
    }

    pub fn record(&mut self, attempt: RecoveryAttempt) {
        self.history
            .entry(attempt.task_id.clone())
            .or_default()
            .push(attempt);
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.history.remove(task_id);
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    /// Number of tasks with recorded attempts.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// A policy plus the attempt history it is evaluated against.
///
/// Shared by all task units of a run; every failure evaluation appends one
/// `RecoveryAttempt`, and a success clears the task's history.
#[derive(Debug, Default)]
pub struct RecoveryManager {
    policy: RecoveryPolicy,
    tracker: Mutex<RecoveryTracker>,
}

impl RecoveryManager {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            tracker: Mutex::new(RecoveryTracker::new()),
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Evaluate a failure of `task` and record the attempt.
    pub fn handle_failure(&self, task: &Task, error: &TaskError) -> (RecoveryAction, RecoveryAttempt) {
        let mut tracker = self.tracker.lock();
        let history = tracker.history(&task.id);
        let action = self
            .policy
            .evaluate_with_budget(&task.kind, task.max_retries, error, history);

        let attempt = RecoveryAttempt {
            task_id: task.id.clone(),
            attempt_number: history.len() as u32 + 1,
            timestamp: Utc::now(),
            error_kind: ErrorKind::classify(error),
            action: action.kind(),
        };
        tracker.record(attempt.clone());

        match &action {
            RecoveryAction::Retry { delay, .. } => debug!(
                task_id = %task.id,
                attempt = attempt.attempt_number,
                delay_ms = delay.as_millis() as u64,
                "retry scheduled"
            ),
            other => warn!(
                task_id = %task.id,
                attempt = attempt.attempt_number,
                action = ?other.kind(),
                reason = other.reason(),
                "recovery exhausted"
            ),
        }

        (action, attempt)
    }

    /// Clear a task's history after it succeeds.
    pub fn record_success(&self, task_id: &TaskId) {
        self.tracker.lock().reset(task_id);
    }

    pub fn history(&self, task_id: &TaskId) -> Vec<RecoveryAttempt> {
        self.tracker.lock().history(task_id).to_vec()
    }

    pub fn reset(&self, task_id: &TaskId) {
        self.tracker.lock().reset(task_id);
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.lock().is_empty()
    }
}
