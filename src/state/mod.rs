//! Shared workflow state.
//!
//! `StateStore` serializes every write to a workflow behind a backend lock
//! and broadcasts each change to subscribers. The backend is pluggable; the
//! in-memory one serves single-process deployments.

mod backend;
mod store;

pub use backend::{LockToken, MemoryBackend, StateBackend, TOPIC_CAPACITY};
pub use store::{StateStore, StateStoreConfig, StateSubscription};
