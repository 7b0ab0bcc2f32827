//! Keyed persistence substrate
//!
//! The suspend/resume protocol only needs a handful of primitives from its
//! store: blobs with expiry, lists usable as a shared queue, sets, and field
//! maps. [`KeyValueStore`] captures exactly those. [`NatsStore`] keeps them in
//! a JetStream key-value bucket that every server instance shares;
//! [`MemoryStore`] is the in-process implementation. [`SuspendStore`] lays the
//! handoff records out on top of either, and [`ConversationStore`] keeps
//! conversation ownership and listener approvals.

mod conversation;
mod memory;
mod nats;
mod suspend;
mod value;

pub use conversation::ConversationStore;
pub use memory::MemoryStore;
pub use nats::NatsStore;
pub use suspend::{SuspendStore, SNAPSHOT_VERSION};

use anyhow::Result;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Address of a stored value: a type-specific prefix plus an id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    pub prefix: &'static str,
    pub id: String,
}

impl StorageKey {
    pub fn new(prefix: &'static str, id: impl Into<String>) -> Self {
        Self {
            prefix,
            id: id.into(),
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.id)
    }
}

/// Which end of a list to push on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Left,
    Right,
}

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_blob(&self, key: &StorageKey) -> Result<Option<Vec<u8>>>;

    /// Store a blob, replacing any value, optionally expiring after `ttl`
    async fn set_blob(&self, key: &StorageKey, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<()>;

    async fn delete(&self, key: &StorageKey) -> Result<()>;

    /// Expire an existing value after `ttl`; missing keys are left alone
    async fn set_expiration(&self, key: &StorageKey, ttl: Duration) -> Result<()>;

    async fn push_range(&self, key: &StorageKey, end: ListEnd, members: &[String]) -> Result<()>;

    /// Inclusive range with negative indexes counting from the end (`0, -1` is everything)
    async fn fetch_range(&self, key: &StorageKey, start: i64, end: i64) -> Result<Vec<String>>;

    /// Wait up to `timeout` for the list to be non-empty, then move its rightmost
    /// element to the left end and return it. The element stays in the list
    /// until [`KeyValueStore::remove_element`] drops it.
    async fn rotate_blocking(&self, key: &StorageKey, timeout: Duration)
        -> Result<Option<String>>;

    /// Remove up to `count` occurrences of `element` (0 removes all)
    async fn remove_element(&self, key: &StorageKey, count: usize, element: &str) -> Result<()>;

    async fn add_members(&self, key: &StorageKey, members: &[String]) -> Result<()>;

    async fn is_member(&self, key: &StorageKey, member: &str) -> Result<bool>;

    async fn get_fields(&self, key: &StorageKey) -> Result<HashMap<String, String>>;

    async fn set_fields(&self, key: &StorageKey, fields: &HashMap<String, String>) -> Result<()>;

    /// Set `field` only if it has no value yet; returns whether it was set.
    /// Atomic across every user of the store.
    async fn set_field_nx(&self, key: &StorageKey, field: &str, value: &str) -> Result<bool>;
}
