//! Logging setup.
//!
//! Log levels:
//! - ERROR: tasks that failed for good, lost state writes
//! - WARN: retries, rejected workflows, soft-dependency warnings
//! - INFO: workflow and task lifecycle
//! - DEBUG: lock contention, breaker bookkeeping, skipped tasks
//!
//! Debug mode is enabled with the `--debug` flag or `MAESTRO_DEBUG=1`.
//! `RUST_LOG` overrides both.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.maestro/maestro.log.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Falls back to stderr when the log file cannot be created. Calling this
/// again after a subscriber is installed has no effect.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let default_level = if debug_enabled { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    // Truncated on startup
    match open_log_file() {
        Some(file) => {
            let _ = builder.with_ansi(false).with_writer(Mutex::new(file)).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var("MAESTRO_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn open_log_file() -> Option<File> {
    let path = Config::log_path().ok()?;
    std::fs::create_dir_all(path.parent()?).ok()?;
    File::create(&path).ok()
}
