//! Key-value, lock and pub/sub backend for the state store.
//!
//! `MemoryBackend` serves a single process. A multi-process deployment plugs
//! a shared store in through the same trait.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

/// Buffered messages per topic before slow subscribers start lagging.
pub const TOPIC_CAPACITY: usize = 256;

/// Proof of lock ownership. Release only succeeds with the matching token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait StateBackend: Send + Sync + std::fmt::Debug {
    /// Try to take the lock `key` for `ttl`. `None` when someone else holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release `key` if `token` still owns it. Returns whether it did.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Vec<u8>>>;
}

#[derive(Debug)]
struct LockEntry {
    token: LockToken,
    expires_at: Instant,
}

#[derive(Debug)]
struct ValueEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process backend built on mutex-guarded maps and broadcast channels.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    locks: Mutex<HashMap<String, LockEntry>>,
    values: Mutex<HashMap<String, ValueEntry>>,
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(key) {
            if entry.expires_at > now {
                return Ok(None);
            }
            debug!(key, "taking over expired lock");
        }
        let token = LockToken::generate();
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(entry) if &entry.token == token => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut values = self.values.lock();
        match values.get(key) {
            Some(entry) if entry.is_expired(now) => {
                values.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.values
            .lock()
            .insert(key.to_string(), ValueEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.values.lock().remove(key).is_some())
    }

    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.topic(topic).send(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Vec<u8>>> {
        Ok(self.topic(topic).subscribe())
    }
}
