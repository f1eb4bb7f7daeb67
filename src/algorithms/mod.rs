//! Rate limiting algorithms
//!
//! Every algorithm comes in two flavours: an in-process policy that keeps its
//! records in a [`Store`](crate::store::Store), and a distributed policy whose
//! whole decision runs as one Lua script inside Redis.

pub mod fixed_window;
pub mod sliding_log;
pub mod sliding_window;
pub mod token_bucket;

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use crate::clock::Clock;
use crate::error::{RateLimitError, Result};
use crate::options::LimiterOptions;

/// Capacity left after a check. Negative means the request was denied.
pub type Remaining = i64;

/// Returned by `check` when a request is denied.
pub const DENIED: Remaining = -1;

pub const DEFAULT_LOCK_STRIPES: usize = 64;

/// A single admission policy.
///
/// `setup` and `teardown` default to no-ops for policies without backend resources.
#[async_trait]
pub trait Policy: Send + Sync {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Charge `weight` against `subject` at `timestamp` (epoch milliseconds).
    ///
    /// `weight` falls back to the configured default weight, then 1;
    /// `timestamp` falls back to the policy's clock.
    async fn check(
        &self,
        subject: &str,
        weight: Option<u64>,
        timestamp: Option<u64>,
    ) -> Result<Remaining>;

    /// Check with zero weight.
    async fn peek(&self, subject: &str) -> Result<Remaining> {
        self.check(subject, Some(0), None).await
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolve the optional `check` arguments against the options and clock.
pub(crate) fn resolve(
    options: &LimiterOptions,
    clock: &dyn Clock,
    weight: Option<u64>,
    timestamp: Option<u64>,
) -> (u64, u64) {
    (
        weight.unwrap_or_else(|| options.default_weight()),
        timestamp.unwrap_or_else(|| clock.now_millis()),
    )
}

/// Saturating conversion of an unsigned amount into a `Remaining`.
pub(crate) fn remaining(value: u64) -> Remaining {
    Remaining::try_from(value).unwrap_or(Remaining::MAX)
}

/// Striped mutexes serializing read-compute-write per subject.
///
/// Subjects hashing to the same stripe share a lock; distinct stripes proceed
/// in parallel.
pub struct SubjectLocks {
    stripes: Vec<Mutex<()>>,
}

impl SubjectLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    pub fn lock(&self, subject: &str) -> Result<MutexGuard<'_, ()>> {
        let mut hasher = DefaultHasher::new();
        subject.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;

        self.stripes[index]
            .lock()
            .map_err(|_| RateLimitError::Internal(format!("Subject lock poisoned for {}", subject)))
    }
}

impl Default for SubjectLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_STRIPES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_resolve_precedence() {
        let clock = ManualClock::new(5_000);
        let options = LimiterOptions::new(10, Duration::from_secs(1));
        assert_eq!(resolve(&options, &clock, None, None), (1, 5_000));

        let options = options.with_weight(3);
        assert_eq!(resolve(&options, &clock, None, None), (3, 5_000));
        assert_eq!(resolve(&options, &clock, Some(7), Some(42)), (7, 42));
    }

    #[test]
    fn test_remaining_saturates() {
        assert_eq!(remaining(8), 8);
        assert_eq!(remaining(u64::MAX), i64::MAX);
    }

    #[test]
    fn test_subject_locks_at_least_one_stripe() {
        let locks = SubjectLocks::new(0);
        assert_eq!(locks.len(), 1);
        let _guard = locks.lock("user:1").unwrap();
    }

    #[test]
    fn test_subject_locks_release_on_drop() {
        let locks = SubjectLocks::default();
        {
            let _guard = locks.lock("user:1").unwrap();
        }
        assert!(locks.lock("user:1").is_ok());
    }
}
