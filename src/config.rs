use envconfig::Envconfig;

use crate::error::{RateLimitError, Result};
use crate::redis::RedisStore;
use crate::store::MemoryStore;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Redis connection URL for the distributed policies
    #[envconfig(from = "RATEKEEPER_REDIS_URL", default = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Entries per generation of the in-memory store
    #[envconfig(from = "RATEKEEPER_MEMORY_MAX_SIZE", default = "10000")]
    pub memory_max_size: usize,

    /// Prefix prepended to every subject in Redis
    #[envconfig(from = "RATEKEEPER_KEY_PREFIX", default = "")]
    pub key_prefix: String,

    /// Striped subject locks per in-memory policy
    #[envconfig(from = "RATEKEEPER_LOCK_STRIPES", default = "64")]
    pub lock_stripes: usize,
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first if present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let config = Config::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(RateLimitError::Configuration(
                "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }

        if self.memory_max_size == 0 {
            return Err(RateLimitError::Configuration(
                "Memory store size must be greater than 0".to_string(),
            ));
        }

        if self.lock_stripes == 0 {
            return Err(RateLimitError::Configuration(
                "Lock stripes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn memory_store<V>(&self) -> MemoryStore<V> {
        MemoryStore::new(self.memory_max_size)
    }

    /// Build an unconnected Redis store; policies connect it in `setup()`.
    pub fn redis_store(&self) -> Result<RedisStore> {
        Ok(RedisStore::new(&self.redis_url)?.with_key_prefix(self.key_prefix.clone()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            memory_max_size: crate::store::DEFAULT_MAX_SIZE,
            key_prefix: String::new(),
            lock_stripes: crate::algorithms::DEFAULT_LOCK_STRIPES,
        }
    }
}
