use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::ExecutorConfig;
use crate::recovery::{CircuitBreakerConfig, RecoveryPolicy, RecoveryStrategy};
use crate::state::StateStoreConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub recovery: RecoverySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_workers: usize,
    pub default_timeout_ms: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            max_workers: defaults.max_workers,
            default_timeout_ms: defaults.default_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            enabled: true,
            failure_threshold: defaults.failure_threshold,
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub lock_ttl_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub lock_max_attempts: u32,
    pub sync_max_retries: u32,
    pub sync_backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_ttl_secs: Option<u64>,
    pub wait_timeout_ms: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        let defaults = StateStoreConfig::default();
        Self {
            lock_ttl_ms: defaults.lock_ttl.as_millis() as u64,
            lock_poll_interval_ms: defaults.lock_poll_interval.as_millis() as u64,
            lock_max_attempts: defaults.lock_max_attempts,
            sync_max_retries: defaults.sync_max_retries,
            sync_backoff_ms: defaults.sync_backoff.as_millis() as u64,
            state_ttl_secs: defaults.state_ttl.map(|ttl| ttl.as_secs()),
            wait_timeout_ms: defaults.wait_timeout.as_millis() as u64,
        }
    }
}

/// Strategy overrides. Kinds not listed keep their built-in strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecoverySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<RecoveryStrategy>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub strategies: HashMap<String, RecoveryStrategy>,
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.log"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Defaults when `path` does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_workers = config.executor.max_workers,
            breakers = config.circuit_breaker.enabled,
            strategies = config.recovery.strategies.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.max_workers == 0 {
            return Err(Error::Validation(
                "executor.max_workers must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Validation(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.state.lock_max_attempts == 0 {
            return Err(Error::Validation(
                "state.lock_max_attempts must be at least 1".to_string(),
            ));
        }
        let strategies = self.recovery.default.iter().chain(self.recovery.strategies.values());
        for strategy in strategies {
            if !strategy.has_valid_backoff() {
                return Err(Error::Validation(format!(
                    "invalid backoff: multiplier {} cap {}s",
                    strategy.backoff_multiplier, strategy.max_backoff_secs
                )));
            }
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_workers: self.executor.max_workers,
            default_timeout: Duration::from_millis(self.executor.default_timeout_ms),
        }
    }

    /// `None` when breakers are disabled.
    pub fn circuit_breaker_config(&self) -> Option<CircuitBreakerConfig> {
        self.circuit_breaker.enabled.then(|| CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            timeout: Duration::from_millis(self.circuit_breaker.timeout_ms),
        })
    }

    pub fn state_config(&self) -> StateStoreConfig {
        StateStoreConfig {
            lock_ttl: Duration::from_millis(self.state.lock_ttl_ms),
            lock_poll_interval: Duration::from_millis(self.state.lock_poll_interval_ms),
            lock_max_attempts: self.state.lock_max_attempts,
            sync_max_retries: self.state.sync_max_retries,
            sync_backoff: Duration::from_millis(self.state.sync_backoff_ms),
            state_ttl: self.state.state_ttl_secs.map(Duration::from_secs),
            wait_timeout: Duration::from_millis(self.state.wait_timeout_ms),
        }
    }

    /// Built-in strategies with this config's overrides applied.
    pub fn recovery_policy(&self) -> RecoveryPolicy {
        let mut policy = RecoveryPolicy::new();
        if let Some(default) = &self.recovery.default {
            policy = policy.with_default(default.clone());
        }
        for (kind, strategy) in &self.recovery.strategies {
            policy = policy.with_strategy(kind, strategy.clone());
        }
        policy
    }
}
