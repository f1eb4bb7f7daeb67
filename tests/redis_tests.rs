//! Tests for the distributed policies.
//!
//! These tests require a Redis instance at `RATEKEEPER_REDIS_URL`
//! (default `redis://127.0.0.1:6379`) and are ignored by default:
//! `cargo test --test redis_tests -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use ratekeeper::{
    Config, Decay, LimiterOptions, Policy, RateLimitError, RateLimiter, RedisFixedWindowCounter,
    RedisSlidingWindowCounter, RedisSlidingWindowLog, RedisStore, RedisTokenBucket,
    TokenBucketOptions, DENIED,
};

const MINUTE: Duration = Duration::from_secs(60);

fn subject(name: &str) -> String {
    format!("{}:{}", name, uuid::Uuid::new_v4())
}

async fn redis_store() -> Option<Arc<RedisStore>> {
    let config = Config::from_env().ok()?;
    let store = config.redis_store().ok()?.with_key_prefix("ratekeeper-test:");
    if store.connect().await.is_err() {
        eprintln!("Skipping test: Redis not available at {}", config.redis_url);
        return None;
    }
    Some(Arc::new(store))
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_fixed_window_counter() {
    let Some(store) = redis_store().await else { return };
    let policy = RedisFixedWindowCounter::new(LimiterOptions::new(10, MINUTE).with_weight(2), store.clone()).unwrap();
    policy.setup().await.unwrap();

    let subject = subject("FixedWindowCounter");
    let mut results = Vec::new();
    for _ in 0..6 {
        results.push(policy.check(&subject, None, None).await.unwrap());
    }
    assert_eq!(results, vec![8, 6, 4, 2, 0, DENIED]);

    let ttl = store.ttl_millis(&subject).await.unwrap();
    assert!(ttl > 0 && ttl <= 60_000);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_fixed_window_starts_fresh_after_interval() {
    let Some(store) = redis_store().await else { return };
    let policy = RedisFixedWindowCounter::new(LimiterOptions::new(10, MINUTE), store).unwrap();
    policy.setup().await.unwrap();

    let subject = subject("FixedWindowCounter");
    assert_eq!(policy.check(&subject, Some(10), Some(0)).await.unwrap(), 0);
    assert_eq!(policy.check(&subject, Some(1), Some(59_999)).await.unwrap(), DENIED);
    assert_eq!(policy.check(&subject, Some(1), Some(60_000)).await.unwrap(), 9);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_sliding_window_counter() {
    let Some(store) = redis_store().await else { return };
    let policy = RedisSlidingWindowCounter::new(LimiterOptions::new(10, MINUTE).with_weight(2), store.clone()).unwrap();
    policy.setup().await.unwrap();

    let subject = subject("SlidingWindowCounter");
    assert_eq!(policy.check(&subject, Some(2), Some(0)).await.unwrap(), 8);
    assert_eq!(policy.check(&subject, Some(2), Some(10_000)).await.unwrap(), 6);
    assert_eq!(policy.check(&subject, Some(2), Some(30_000)).await.unwrap(), 5);

    let other = self::subject("SlidingWindowCounter");
    assert_eq!(policy.check(&other, Some(12), None).await.unwrap(), DENIED);

    let ttl = store.ttl_millis(&subject).await.unwrap();
    assert!(ttl > 0 && ttl <= 60_000);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_sliding_window_counter_exponential() {
    let Some(store) = redis_store().await else { return };
    let policy = RedisSlidingWindowCounter::new(LimiterOptions::new(10, MINUTE), store)
        .unwrap()
        .with_decay(Decay::Exponential);
    policy.setup().await.unwrap();

    let subject = subject("SlidingWindowCounter");
    assert_eq!(policy.check(&subject, Some(10), Some(0)).await.unwrap(), 0);
    assert_eq!(policy.check(&subject, Some(7), Some(59_999)).await.unwrap(), DENIED);
    assert_eq!(policy.check(&subject, Some(6), Some(60_000)).await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_sliding_window_log() {
    let Some(store) = redis_store().await else { return };
    let policy = RedisSlidingWindowLog::new(LimiterOptions::new(5, Duration::from_secs(1)), store).unwrap();
    policy.setup().await.unwrap();

    let subject = subject("SlidingWindowLog");
    assert_eq!(policy.check(&subject, Some(1), Some(0)).await.unwrap(), 4);
    // Same weight at the same timestamp must be logged twice
    assert_eq!(policy.check(&subject, Some(1), Some(0)).await.unwrap(), 3);
    assert_eq!(policy.check(&subject, Some(3), Some(500)).await.unwrap(), 0);
    assert_eq!(policy.check(&subject, Some(1), Some(1_000)).await.unwrap(), DENIED);
    assert_eq!(policy.check(&subject, Some(2), Some(1_001)).await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_token_bucket() {
    let Some(store) = redis_store().await else { return };
    let options = TokenBucketOptions::new(10, Duration::from_secs(1), 1).with_weight(2);
    let policy = RedisTokenBucket::new(options, store).unwrap();
    policy.setup().await.unwrap();

    let subject = subject("TokenBucket");
    assert_eq!(policy.check(&subject, None, Some(0)).await.unwrap(), 8);
    assert_eq!(policy.check(&subject, Some(2), Some(500)).await.unwrap(), 6);
    assert_eq!(policy.check(&subject, Some(11), Some(600)).await.unwrap(), DENIED);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_concurrent_checks_never_lose_updates() {
    let Some(store) = redis_store().await else { return };
    let policy = Arc::new(RedisFixedWindowCounter::new(LimiterOptions::new(50, MINUTE), store).unwrap());
    policy.setup().await.unwrap();

    let subject = Arc::new(subject("Concurrent"));
    let handles: Vec<_> = (0..50)
        .map(|_| {
            let policy = policy.clone();
            let subject = subject.clone();
            tokio::spawn(async move { policy.check(&subject, Some(1), None).await })
        })
        .collect();

    let mut remaining: Vec<i64> = Vec::new();
    for handle in handles {
        remaining.push(handle.await.unwrap().unwrap());
    }
    remaining.sort_unstable();
    assert_eq!(remaining, (0..50).collect::<Vec<i64>>());
    assert_eq!(policy.check(&subject, Some(1), None).await.unwrap(), DENIED);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_composite_lifecycle() {
    let Some(store) = redis_store().await else { return };
    let limiter = RateLimiter::builder()
        .policy(RedisFixedWindowCounter::new(LimiterOptions::new(2, Duration::from_secs(1)), store.clone()).unwrap())
        .policy(RedisSlidingWindowLog::new(LimiterOptions::new(5, MINUTE), store.clone()).unwrap())
        .build();
    limiter.setup().await.unwrap();

    let subject = subject("Composite");
    let verdict = limiter.verdict(&subject, None).await.unwrap();
    assert_eq!(verdict.remaining, vec![1, 4]);

    limiter.teardown().await.unwrap();
    assert!(!store.is_connected().await);

    let err = limiter.verdict(&subject, None).await.unwrap_err();
    assert!(matches!(err, RateLimitError::Multiple { .. }));
    assert!(err.is_backend());
}
