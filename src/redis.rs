//! Redis-backed store for the distributed policies.
//!
//! Distributed policies never read a record and write it back in two steps.
//! Each one registers a Lua script during `setup()` and every `check` is a
//! single script invocation, so Redis serializes concurrent updates to the
//! same subject.

use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tokio::sync::RwLock;

use crate::error::{RateLimitError, Result};

/// A named Lua script executed atomically by Redis.
pub struct AtomicScript {
    name: &'static str,
    lua: &'static str,
    script: Script,
}

impl AtomicScript {
    pub fn new(name: &'static str, lua: &'static str) -> Self {
        Self {
            name,
            lua,
            script: Script::new(lua),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// SHA1 digest Redis uses to cache the script
    pub fn hash(&self) -> &str {
        self.script.get_hash()
    }
}

pub struct RedisStore {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    key_prefix: String,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            key_prefix: String::new(),
        })
    }

    /// Prefix prepended to every subject to form its Redis key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key(&self, subject: &str) -> String {
        format!("{}{}", self.key_prefix, subject)
    }

    /// Open the shared connection. Calling this again while connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.write().await;
        if connection.is_some() {
            return Ok(());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to Redis");
        *connection = Some(conn);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Drop the shared connection; later calls fail with `NotConnected` until `connect()`.
    pub async fn disconnect(&self) {
        if self.connection.write().await.take().is_some() {
            tracing::info!("Disconnected from Redis");
        }
    }

    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.connection().await?;
        let pong = redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(pong)
    }

    /// Load `script` into the Redis script cache.
    pub async fn register(&self, script: &AtomicScript) -> Result<()> {
        let mut conn = self.connection().await?;
        let sha = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.lua)
            .query_async::<_, String>(&mut conn)
            .await?;

        tracing::info!(script = script.name, sha = %sha, "Registered rate limit script");
        Ok(())
    }

    /// Run `script` against the key of `subject` in one round trip.
    ///
    /// Falls back to re-sending the source if the script cache was flushed.
    pub async fn invoke(&self, script: &AtomicScript, subject: &str, args: &[u64]) -> Result<i64> {
        let mut conn = self.connection().await?;

        let mut invocation = script.script.prepare_invoke();
        invocation.key(self.key(subject));
        for arg in args {
            invocation.arg(*arg);
        }

        invocation.invoke_async(&mut conn).await.map_err(|e| {
            tracing::warn!(script = script.name, subject, error = %e, "Rate limit script failed");
            RateLimitError::Redis(e)
        })
    }

    /// Remove the record of `subject`, returning whether one existed.
    pub async fn delete(&self, subject: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted = redis::cmd("DEL")
            .arg(self.key(subject))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    /// Remaining time to live of the record of `subject` in milliseconds.
    ///
    /// Redis reports `-2` for a missing key and `-1` for a key without expiry.
    pub async fn ttl_millis(&self, subject: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        let ttl = redis::cmd("PTTL")
            .arg(self.key(subject))
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(ttl)
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(RateLimitError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefix() {
        let store = RedisStore::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_key_prefix("ratekeeper:");
        assert_eq!(store.key("user:42"), "ratekeeper:user:42");
    }

    #[test]
    fn test_invalid_url_is_backend_error() {
        let err = RedisStore::new("not a url").err().unwrap();
        assert!(err.is_backend());
    }

    #[test]
    fn test_script_hash_is_stable() {
        let a = AtomicScript::new("noop", "return 0");
        let b = AtomicScript::new("noop", "return 0");
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.name(), "noop");
    }

    #[tokio::test]
    async fn test_invoke_before_connect_fails() {
        let store = RedisStore::new("redis://127.0.0.1:6379").unwrap();
        let script = AtomicScript::new("noop", "return 0");

        assert!(!store.is_connected().await);
        let err = store.invoke(&script, "subject", &[]).await.unwrap_err();
        assert!(matches!(err, RateLimitError::NotConnected));
    }
}
