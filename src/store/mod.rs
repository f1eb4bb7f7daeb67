//! Key/value stores holding per-subject policy records.

mod memory;

pub use memory::{MemoryStore, DEFAULT_MAX_SIZE};

use std::time::Duration;

use crate::error::Result;

/// A stored value together with its absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry<V> {
    pub value: V,
    /// Absolute expiry in epoch milliseconds; `None` never expires
    pub expires_at: Option<u64>,
}

impl<V> StoreEntry<V> {
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at < now)
    }
}

/// Synchronous key/value store with per-key TTL used by the in-process policies.
///
/// `get` on an expired key behaves exactly like `get` on a missing key.
/// Policies serialize the `get` then `set` sequence per subject themselves,
/// so implementations only need to keep each call internally consistent.
pub trait Store<V>: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<V>>;

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()>;
}

impl<V, S: Store<V> + ?Sized> Store<V> for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl)
    }
}
