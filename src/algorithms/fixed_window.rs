//! Fixed window counter
//!
//! Weight accumulates in a window that starts with the first request after the
//! previous window ended. A burst straddling a window boundary can admit up to
//! twice the capacity in a short span; that is inherent to the algorithm.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

use super::{remaining, resolve, Policy, Remaining, SubjectLocks, DENIED};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::options::LimiterOptions;
use crate::redis::{AtomicScript, RedisStore};
use crate::store::Store;

/// Stored state of one subject's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Weight admitted in this window
    pub weight: u64,
    /// Window start in epoch milliseconds
    pub timestamp: u64,
}

pub struct FixedWindowCounter<S> {
    options: LimiterOptions,
    store: S,
    clock: Arc<dyn Clock>,
    locks: SubjectLocks,
}

impl<S: Store<Window>> FixedWindowCounter<S> {
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

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn decide(&self, subject: &str, weight: u64, timestamp: u64) -> Result<Remaining> {
        let capacity = self.options.capacity;
        if weight > capacity {
            tracing::debug!(subject, weight, "Fixed window denied request");
            return Ok(DENIED);
        }

        let ttl = Some(self.options.interval);
        let _guard = self.locks.lock(subject)?;

        let window = match self.store.get(subject)? {
            Some(window) if timestamp < window.timestamp.saturating_add(self.options.interval_ms()) => window,
            _ => {
                if weight > 0 {
                    tracing::trace!(subject, timestamp, "Starting new window");
                    self.store.set(subject, Window { weight, timestamp }, ttl)?;
                }
                return Ok(remaining(capacity - weight));
            }
        };

        let total = window.weight + weight;
        if total > capacity {
            tracing::debug!(subject, weight, "Fixed window denied request");
            return Ok(DENIED);
        }

        if weight > 0 {
            self.store.set(
                subject,
                Window {
                    weight: total,
                    timestamp: window.timestamp,
                },
                ttl,
            )?;
        }
        Ok(remaining(capacity - total))
    }
}

#[async_trait]
impl<S: Store<Window>> Policy for FixedWindowCounter<S> {
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

const FIXED_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local weight = tonumber(ARGV[1])
local timestamp = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local interval = tonumber(ARGV[4])

if weight > capacity then
    return -1
end

local data = redis.call('HMGET', key, 'weight', 'timestamp')
local window_weight = tonumber(data[1])
local window_start = tonumber(data[2])

if window_weight == nil or window_start == nil or timestamp >= window_start + interval then
    if weight > 0 then
        redis.call('HSET', key, 'weight', weight, 'timestamp', timestamp)
        redis.call('PEXPIRE', key, interval)
    end
    return capacity - weight
end

local total = window_weight + weight
if total > capacity then
    return -1
end

if weight > 0 then
    redis.call('HSET', key, 'weight', total)
    redis.call('PEXPIRE', key, interval)
end
return capacity - total
"#;

static FIXED_WINDOW_SCRIPT: LazyLock<AtomicScript> =
    LazyLock::new(|| AtomicScript::new("fixed_window_counter", FIXED_WINDOW_LUA));

/// Fixed window counter whose decision runs inside Redis.
pub struct RedisFixedWindowCounter {
    options: LimiterOptions,
    store: Arc<RedisStore>,
    clock: Arc<dyn Clock>,
}

impl RedisFixedWindowCounter {
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
impl Policy for RedisFixedWindowCounter {
    async fn setup(&self) -> Result<()> {
        self.store.connect().await?;
        self.store.register(&FIXED_WINDOW_SCRIPT).await
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
                &FIXED_WINDOW_SCRIPT,
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
