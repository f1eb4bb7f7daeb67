//! Sliding window counter
//!
//! Approximates a sliding window with a single decaying counter: the weight
//! recorded at the last update decays toward zero as time passes, then the
//! new request's weight is added on top.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};

use super::{resolve, Policy, Remaining, SubjectLocks, DENIED};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::options::LimiterOptions;
use crate::redis::{AtomicScript, RedisStore};
use crate::store::Store;

/// How the previous weight decays over the elapsed time.
///
/// The two formulas give different numbers for the same input. A deployment
/// must use one formula for every process sharing a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decay {
    /// `weight * (1 - elapsed / interval)`, reaching zero after one interval
    #[default]
    Linear,
    /// `weight * e^(-elapsed / interval)`
    Exponential,
}

impl Decay {
    pub fn apply(self, weight: f64, elapsed_ms: u64, interval_ms: u64) -> f64 {
        let ratio = elapsed_ms as f64 / interval_ms as f64;
        match self {
            Decay::Linear => (weight - weight * ratio).max(0.0),
            Decay::Exponential => weight * (-ratio).exp(),
        }
    }

    fn code(self) -> u64 {
        match self {
            Decay::Linear => 0,
            Decay::Exponential => 1,
        }
    }
}

/// Decayed weight as of the last admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayedWindow {
    pub weight: f64,
    pub timestamp: u64,
}

fn to_remaining(capacity: u64, total: f64) -> Remaining {
    // Truncated the same way Redis converts a Lua number reply to an integer
    (capacity as f64 - total) as Remaining
}

pub struct SlidingWindowCounter<S> {
    options: LimiterOptions,
    decay: Decay,
    store: S,
    clock: Arc<dyn Clock>,
    locks: SubjectLocks,
}

impl<S: Store<DecayedWindow>> SlidingWindowCounter<S> {
    pub fn new(options: LimiterOptions, store: S) -> Result<Self> {
        Self::with_clock(options, store, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(options: LimiterOptions, store: S, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            options: options.validated()?,
            decay: Decay::default(),
            store,
            clock,
            locks: SubjectLocks::default(),
        })
    }

    pub fn with_decay(mut self, decay: Decay) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_lock_stripes(mut self, stripes: usize) -> Self {
        self.locks = SubjectLocks::new(stripes);
        self
    }

    pub fn decay(&self) -> Decay {
        self.decay
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn decide(&self, subject: &str, weight: u64, timestamp: u64) -> Result<Remaining> {
        let capacity = self.options.capacity;
        if weight > capacity {
            tracing::debug!(subject, weight, "Sliding window denied request");
            return Ok(DENIED);
        }

        let _guard = self.locks.lock(subject)?;
        let total = match self.store.get(subject)? {
            Some(record) => {
                let elapsed = timestamp.saturating_sub(record.timestamp);
                self.decay
                    .apply(record.weight, elapsed, self.options.interval_ms())
                    + weight as f64
            }
            None => weight as f64,
        };

        if total > capacity as f64 {
            tracing::debug!(subject, weight, total, "Sliding window denied request");
            return Ok(DENIED);
        }

        if weight > 0 {
            self.store.set(
                subject,
                DecayedWindow {
                    weight: total,
                    timestamp,
                },
                Some(self.options.interval),
            )?;
        }
        Ok(to_remaining(capacity, total))
    }
}

#[async_trait]
impl<S: Store<DecayedWindow>> Policy for SlidingWindowCounter<S> {
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

const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local weight = tonumber(ARGV[1])
local timestamp = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local interval = tonumber(ARGV[4])
local decay = tonumber(ARGV[5])

if weight > capacity then
    return -1
end

local data = redis.call('HMGET', key, 'weight', 'timestamp')
local record_weight = tonumber(data[1]) or 0
local record_timestamp = tonumber(data[2]) or timestamp

local elapsed = math.max(0, timestamp - record_timestamp)
local decayed
if decay == 1 then
    decayed = record_weight * math.exp(-elapsed / interval)
else
    decayed = math.max(0, record_weight - record_weight * elapsed / interval)
end

local total = decayed + weight
if total > capacity then
    return -1
end

if weight > 0 then
    redis.call('HSET', key, 'weight', tostring(total), 'timestamp', timestamp)
    redis.call('PEXPIRE', key, interval)
end
return capacity - total
"#;

static SLIDING_WINDOW_SCRIPT: LazyLock<AtomicScript> =
    LazyLock::new(|| AtomicScript::new("sliding_window_counter", SLIDING_WINDOW_LUA));

/// Sliding window counter whose decision runs inside Redis.
pub struct RedisSlidingWindowCounter {
    options: LimiterOptions,
    decay: Decay,
    store: Arc<RedisStore>,
    clock: Arc<dyn Clock>,
}

impl RedisSlidingWindowCounter {
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
            decay: Decay::default(),
            store,
            clock,
        })
    }

    pub fn with_decay(mut self, decay: Decay) -> Self {
        self.decay = decay;
        self
    }
}

#[async_trait]
impl Policy for RedisSlidingWindowCounter {
    async fn setup(&self) -> Result<()> {
        self.store.connect().await?;
        self.store.register(&SLIDING_WINDOW_SCRIPT).await
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
                &SLIDING_WINDOW_SCRIPT,
                subject,
                &[
                    weight,
                    timestamp,
                    self.options.capacity,
                    self.options.interval_ms(),
                    self.decay.code(),
                ],
            )
            .await
    }

    async fn teardown(&self) -> Result<()> {
        self.store.disconnect().await;
        Ok(())
    }
}
