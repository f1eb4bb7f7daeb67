//! Sliding window log
//!
//! Keeps one entry per admitted request over the trailing interval, which
//! gives exact sliding window semantics at the cost of memory proportional to
//! the number of requests in the window. Every entry carries weight >= 1 and
//! the total never exceeds capacity, so a log holds at most `capacity` entries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

use super::{remaining, resolve, Policy, Remaining, SubjectLocks, DENIED};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::options::LimiterOptions;
use crate::redis::{AtomicScript, RedisStore};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub weight: u64,
    pub timestamp: u64,
}

/// Admitted requests of one subject, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLog {
    pub entries: Vec<LogEntry>,
}

impl RequestLog {
    /// Drop entries older than `cutoff`.
    pub fn prune(&mut self, cutoff: u64) {
        self.entries.retain(|entry| entry.timestamp >= cutoff);
    }

    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|entry| entry.weight).sum()
    }
}

pub struct SlidingWindowLog<S> {
    options: LimiterOptions,
    store: S,
    clock: Arc<dyn Clock>,
    locks: SubjectLocks,
}

impl<S: Store<RequestLog>> SlidingWindowLog<S> {
    pub fn new(options: LimiterOptions, store: S) -> Result<Self> {
        Self::with_clock(options, store, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(options: LimiterOptions, store: S, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            options: options.validated()?,
            store,
            clock,
            locks: SubjectLocks::default(),
        })
    }

    pub fn with_lock_stripes(mut self, stripes: usize) -> Self {
        self.locks = SubjectLocks::new(stripes);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn decide(&self, subject: &str, weight: u64, timestamp: u64) -> Result<Remaining> {
        let capacity = self.options.capacity;
        if weight > capacity {
            tracing::debug!(subject, weight, "Sliding log denied request");
            return Ok(DENIED);
        }

        let _guard = self.locks.lock(subject)?;

        let mut log = self.store.get(subject)?.unwrap_or_default();
        log.prune(timestamp.saturating_sub(self.options.interval_ms()));

        let total = log.total_weight() + weight;
        if total > capacity {
            tracing::debug!(subject, weight, total, "Sliding log denied request");
            return Ok(DENIED);
        }

        if weight > 0 {
            log.entries.push(LogEntry { weight, timestamp });
            self.store.set(subject, log, Some(self.options.interval))?;
        }
        Ok(remaining(capacity - total))
    }
}

#[async_trait]
impl<S: Store<RequestLog>> Policy for SlidingWindowLog<S> {
    async fn check(
        &self,
        subject: &str,
        weight: Option<u64>,
        timestamp: Option<u64>,
    ) -> Result<Remaining> {
        let (weight, timestamp) = resolve(&self.options, self.clock.as_ref(), weight, timestamp);
        self.decide(subject, weight, timestamp)
    }
}

// Members are "<weight>:<timestamp>:<n>" scored by timestamp; n counts members
// already sharing the timestamp so equal requests never collapse into one.
const SLIDING_LOG_LUA: &str = r#"
local key = KEYS[1]
local weight = tonumber(ARGV[1])
local timestamp = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local interval = tonumber(ARGV[4])

if weight > capacity then
    return -1
end

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (timestamp - interval))

local total = weight
local members = redis.call('ZRANGE', key, 0, -1)
for _, member in ipairs(members) do
    total = total + tonumber(string.match(member, '^(%d+):'))
end

if total > capacity then
    return -1
end

if weight > 0 then
    local n = redis.call('ZCOUNT', key, timestamp, timestamp)
    redis.call('ZADD', key, timestamp, weight .. ':' .. timestamp .. ':' .. n)
    redis.call('PEXPIRE', key, interval)
end

return capacity - total
"#;

static SLIDING_LOG_SCRIPT: LazyLock<AtomicScript> =
    LazyLock::new(|| AtomicScript::new("sliding_window_log", SLIDING_LOG_LUA));

/// Sliding window log kept in a Redis sorted set.
pub struct RedisSlidingWindowLog {
    options: LimiterOptions,
    store: Arc<RedisStore>,
    clock: Arc<dyn Clock>,
}

impl RedisSlidingWindowLog {
    pub fn new(options: LimiterOptions, store: Arc<RedisStore>) -> Result<Self> {
        Self::with_clock(options, store, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        options: LimiterOptions,
        store: Arc<RedisStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            options: options.validated()?,
            store,
            clock,
        })
    }
}

#[async_trait]
impl Policy for RedisSlidingWindowLog {
    async fn setup(&self) -> Result<()> {
        self.store.connect().await?;
        self.store.register(&SLIDING_LOG_SCRIPT).await
    }

    async fn check(
        &self,
        subject: &str,
        weight: Option<u64>,
        timestamp: Option<u64>,
    ) -> Result<Remaining> {
        let (weight, timestamp) = resolve(&self.options, self.clock.as_ref(), weight, timestamp);
        self.store
            .invoke(
                &SLIDING_LOG_SCRIPT,
                subject,
                &[weight, timestamp, self.options.capacity, self.options.interval_ms()],
            )
            .await
    }

    async fn teardown(&self) -> Result<()> {
        self.store.disconnect().await;
        Ok(())
    }
}
