use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Store, StoreEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitError, Result};

pub const DEFAULT_MAX_SIZE: usize = 10_000;

struct Generations<V> {
    current: HashMap<String, StoreEntry<V>>,
    retired: HashMap<String, StoreEntry<V>>,
}

impl<V> Generations<V> {
    fn take_live(
        map: &mut HashMap<String, StoreEntry<V>>,
        key: &str,
        now: u64,
    ) -> Option<StoreEntry<V>> {
        let entry = map.remove(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry)
    }
}

/// Bounded in-memory store using two generations of maps.
///
/// When the current generation reaches `max_size` it replaces the retired one
/// wholesale and a fresh current map is started. Lookups fall through to the
/// retired generation and promote hits back into the current one, so hot keys
/// survive a rollover while cold keys are dropped two rollovers later.
pub struct MemoryStore<V> {
    generations: Mutex<Generations<V>>,
    max_size: usize,
    clock: Arc<dyn Clock>,
}

impl<V> MemoryStore<V> {
    pub fn new(max_size: usize) -> Self {
        Self::with_clock(max_size, Arc::new(SystemClock::new()))
    }

    /// Create a store that reads expiry time from `clock`.
    pub fn with_clock(max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            generations: Mutex::new(Generations {
                current: HashMap::new(),
                retired: HashMap::new(),
            }),
            max_size: max_size.max(1),
            clock,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Entries held across both generations, expired ones included.
    pub fn len(&self) -> Result<usize> {
        let generations = self.lock()?;
        Ok(generations.current.len() + generations.retired.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Generations<V>>> {
        self.generations
            .lock()
            .map_err(|_| RateLimitError::Internal("Failed to acquire memory store lock".to_string()))
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl<V: Clone + Send> Store<V> for MemoryStore<V> {
    fn get(&self, key: &str) -> Result<Option<V>> {
        let now = self.clock.now_millis();
        let mut generations = self.lock()?;

        if let Some(entry) = Generations::take_live(&mut generations.current, key, now) {
            let value = entry.value.clone();
            generations.current.insert(key.to_string(), entry);
            return Ok(Some(value));
        }

        if let Some(entry) = Generations::take_live(&mut generations.retired, key, now) {
            let value = entry.value.clone();
            generations.current.insert(key.to_string(), entry);
            return Ok(Some(value));
        }

        Ok(None)
    }

    fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        let now = self.clock.now_millis();
        let mut generations = self.lock()?;

        if generations.current.len() >= self.max_size && !generations.current.contains_key(key) {
            tracing::debug!(
                size = generations.current.len(),
                "Retiring memory store generation"
            );
            let full = mem::take(&mut generations.current);
            generations.retired = full;
        }

        let entry = StoreEntry {
            value,
            expires_at: ttl.map(|ttl| now + ttl.as_millis() as u64),
        };
        generations.retired.remove(key);
        generations.current.insert(key.to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock(max_size: usize) -> (MemoryStore<u64>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let store = MemoryStore::with_clock(max_size, Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn test_get_missing_key() {
        let (store, _) = store_with_clock(10);
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_and_get() {
        let (store, _) = store_with_clock(10);
        store.set("a", 1, None).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(1));

        store.set("a", 2, None).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(2));
    }

    #[test]
    fn test_expired_entry_is_absent_and_evicted() {
        let (store, clock) = store_with_clock(10);
        store.set("a", 1, Some(Duration::from_millis(100))).unwrap();

        clock.advance(Duration::from_millis(100));
        assert_eq!(store.get("a").unwrap(), Some(1));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("a").unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_rollover_retires_current_generation() {
        let (store, _) = store_with_clock(2);
        store.set("a", 1, None).unwrap();
        store.set("b", 2, None).unwrap();
        // current is full: "a" and "b" move to retired
        store.set("c", 3, None).unwrap();
        assert_eq!(store.len().unwrap(), 3);

        // "a" is promoted back into current
        assert_eq!(store.get("a").unwrap(), Some(1));

        // current {c, a} is full again and replaces retired {b}
        store.set("d", 4, None).unwrap();
        assert_eq!(store.get("b").unwrap(), None);
        assert_eq!(store.get("a").unwrap(), Some(1));
        assert_eq!(store.get("c").unwrap(), Some(3));
        assert_eq!(store.get("d").unwrap(), Some(4));
    }

    #[test]
    fn test_overwrite_does_not_trigger_rollover() {
        let (store, _) = store_with_clock(2);
        store.set("a", 1, None).unwrap();
        store.set("b", 2, None).unwrap();
        store.set("b", 3, None).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(1));
        assert_eq!(store.get("b").unwrap(), Some(3));
    }

    #[test]
    fn test_expired_entry_in_retired_generation_is_dropped() {
        let (store, clock) = store_with_clock(1);
        store.set("a", 1, Some(Duration::from_millis(10))).unwrap();
        store.set("b", 2, None).unwrap();

        clock.advance(Duration::from_millis(50));
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.len().unwrap(), 1);
    }
}
