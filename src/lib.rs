//! Weighted rate limiting policies over pluggable stores.
//!
//! Four algorithms are provided, each in an in-process flavour backed by a
//! [`Store`] and a distributed flavour running atomically inside Redis:
//! fixed window counter, sliding window counter, sliding window log and
//! token bucket. A [`RateLimiter`] combines several policies so a caller can
//! enforce independent limits (per second, per day, ...) in one call.
//!
//! ```
//! use ratekeeper::{FixedWindowCounter, LimiterOptions, MemoryStore, Policy, Window};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let options = LimiterOptions::new(10, Duration::from_secs(1));
//! let policy = FixedWindowCounter::new(options, MemoryStore::<Window>::default()).unwrap();
//!
//! let remaining = policy.check("user:42", Some(2), None).await.unwrap();
//! assert_eq!(remaining, 8);
//! # });
//! ```

pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod options;
pub mod rate_limiter;
pub mod redis;
pub mod store;

pub use algorithms::fixed_window::{FixedWindowCounter, RedisFixedWindowCounter, Window};
pub use algorithms::sliding_log::{LogEntry, RedisSlidingWindowLog, RequestLog, SlidingWindowLog};
pub use algorithms::sliding_window::{
    Decay, DecayedWindow, RedisSlidingWindowCounter, SlidingWindowCounter,
};
pub use algorithms::token_bucket::{Bucket, RedisTokenBucket, TokenBucket};
pub use algorithms::{Policy, Remaining, DENIED};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{RateLimitError, Result};
pub use options::{LimiterOptions, TokenBucketOptions};
pub use rate_limiter::{RateLimiter, Verdict};
pub use crate::redis::{AtomicScript, RedisStore};
pub use store::{MemoryStore, Store, StoreEntry};
