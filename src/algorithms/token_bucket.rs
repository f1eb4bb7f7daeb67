//! Token bucket
//!
//! A bucket holds up to `capacity` tokens and regains `refill` tokens per
//! elapsed interval. A request spends `weight` tokens or is denied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use super::{remaining, resolve, Policy, Remaining, SubjectLocks, DENIED};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::options::TokenBucketOptions;
use crate::redis::{AtomicScript, RedisStore};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Tokens left after the last admitted request
    pub tokens: u64,
    /// Time of the last admitted request in epoch milliseconds
    pub timestamp: u64,
}

impl Bucket {
    /// Tokens available at `now`, capped at `capacity`.
    ///
    /// Only whole tokens are added: `floor(refill * elapsed / interval)`.
    pub fn available_tokens(&self, capacity: u64, refill: u64, interval_ms: u64, now: u64) -> u64 {
        let elapsed = now.saturating_sub(self.timestamp) as u128;
        let refilled = refill as u128 * elapsed / interval_ms as u128;
        (self.tokens as u128 + refilled).min(capacity as u128) as u64
    }

    /// Time until `required` tokens are available at `now`.
    ///
    /// `Duration::ZERO` when they already are, `None` when `required`
    /// exceeds `capacity` and can never be satisfied.
    pub fn time_until_available(
        &self,
        required: u64,
        capacity: u64,
        refill: u64,
        interval_ms: u64,
        now: u64,
    ) -> Option<Duration> {
        if required > capacity {
            return None;
        }
        if self.tokens >= required {
            return Some(Duration::ZERO);
        }
        let missing = (required - self.tokens) as u128;
        // Smallest elapsed time whose floored refill covers the missing tokens
        let needed_ms = (missing * interval_ms as u128).div_ceil(refill as u128) as u64;
        let elapsed = now.saturating_sub(self.timestamp);
        Some(Duration::from_millis(needed_ms.saturating_sub(elapsed)))
    }
}

pub struct TokenBucket<S> {
    options: TokenBucketOptions,
    store: S,
    clock: Arc<dyn Clock>,
    locks: SubjectLocks,
}

impl<S: Store<Bucket>> TokenBucket<S> {
    pub fn new(options: TokenBucketOptions, store: S) -> Result<Self> {
        Self::with_clock(options, store, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(options: TokenBucketOptions, store: S, clock: Arc<dyn Clock>) -> Result<Self> {
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

    pub fn options(&self) -> &TokenBucketOptions {
        &self.options
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Wait time until `subject` could spend `weight` tokens at `now`, or
    /// `None` if `weight` is more than the bucket can ever hold.
    pub fn time_until_available(&self, subject: &str, weight: u64, now: u64) -> Result<Option<Duration>> {
        let capacity = self.options.limiter.capacity;
        if weight > capacity {
            return Ok(None);
        }
        let Some(bucket) = self.store.get(subject)? else {
            return Ok(Some(Duration::ZERO));
        };
        Ok(bucket.time_until_available(
            weight,
            capacity,
            self.options.refill,
            self.options.limiter.interval_ms(),
            now,
        ))
    }

    fn decide(&self, subject: &str, weight: u64, timestamp: u64) -> Result<Remaining> {
        let capacity = self.options.limiter.capacity;
        if weight > capacity {
            return Ok(DENIED);
        }

        let _guard = self.locks.lock(subject)?;
        let current = match self.store.get(subject)? {
            Some(bucket) => bucket.available_tokens(
                capacity,
                self.options.refill,
                self.options.limiter.interval_ms(),
                timestamp,
            ),
            None => capacity,
        };

        let Some(tokens) = current.checked_sub(weight) else {
            tracing::debug!(subject, weight, current, "Token bucket denied request");
            return Ok(DENIED);
        };

        if weight > 0 {
            self.store.set(
                subject,
                Bucket { tokens, timestamp },
                Some(self.options.limiter.interval),
            )?;
        }
        Ok(remaining(tokens))
    }
}

#[async_trait]
impl<S: Store<Bucket>> Policy for TokenBucket<S> {
    async fn check(
        &self,
        subject: &str,
        weight: Option<u64>,
        timestamp: Option<u64>,
    ) -> Result<Remaining> {
        let (weight, timestamp) =
            resolve(&self.options.limiter, self.clock.as_ref(), weight, timestamp);
        self.decide(subject, weight, timestamp)
    }
}

// The stored timestamp is left at its first value so refill keeps accruing
// from there instead of restarting on every admitted request.
const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local weight = tonumber(ARGV[1])
local timestamp = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local interval = tonumber(ARGV[4])
local refill = tonumber(ARGV[5])

if weight > capacity then
    return -1
end

local data = redis.call('HMGET', key, 'tokens', 'timestamp')
local tokens = tonumber(data[1])
local last = tonumber(data[2])

if tokens == nil or last == nil then
    local left = capacity - weight
    if weight > 0 then
        redis.call('HSET', key, 'tokens', left, 'timestamp', timestamp)
        redis.call('PEXPIRE', key, interval)
    end
    return left
end

local elapsed = math.max(0, timestamp - last)
local refilled = math.floor(refill * elapsed / interval)
local current = math.min(capacity, tokens + refilled)
local left = current - weight

if left < 0 then
    return -1
end

if weight > 0 then
    redis.call('HSET', key, 'tokens', left, 'timestamp', last)
    redis.call('PEXPIRE', key, interval)
end
return left
"#;

static TOKEN_BUCKET_SCRIPT: LazyLock<AtomicScript> =
    LazyLock::new(|| AtomicScript::new("token_bucket", TOKEN_BUCKET_LUA));

/// Token bucket whose decision runs inside Redis.
pub struct RedisTokenBucket {
    options: TokenBucketOptions,
    store: Arc<RedisStore>,
    clock: Arc<dyn Clock>,
}

impl RedisTokenBucket {
    pub fn new(options: TokenBucketOptions, store: Arc<RedisStore>) -> Result<Self> {
        Self::with_clock(options, store, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        options: TokenBucketOptions,
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
impl Policy for RedisTokenBucket {
    async fn setup(&self) -> Result<()> {
        self.store.connect().await?;
        self.store.register(&TOKEN_BUCKET_SCRIPT).await
    }

    async fn check(
        &self,
        subject: &str,
        weight: Option<u64>,
        timestamp: Option<u64>,
    ) -> Result<Remaining> {
        let limiter = &self.options.limiter;
        let (weight, timestamp) = resolve(limiter, self.clock.as_ref(), weight, timestamp);
        self.store
            .invoke(
                &TOKEN_BUCKET_SCRIPT,
                subject,
                &[
                    weight,
                    timestamp,
                    limiter.capacity,
                    limiter.interval_ms(),
                    self.options.refill,
                ],
            )
            .await
    }

    async fn teardown(&self) -> Result<()> {
        self.store.disconnect().await;
        Ok(())
    }
}
