//! Per-policy options and their validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::Result;

/// Capacity budget shared by every algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LimiterOptions {
    /// Maximum weight admitted per interval
    #[validate(range(min = 1, message = "capacity must be greater than 0"))]
    pub capacity: u64,

    /// Window or refill period
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_interval"))]
    pub interval: Duration,

    /// Weight charged when `check` is called without one
    #[serde(default)]
    #[validate(range(min = 1, message = "default weight must be at least 1"))]
    pub weight: Option<u64>,
}

impl LimiterOptions {
    pub fn new(capacity: u64, interval: Duration) -> Self {
        Self {
            capacity,
            interval,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval.as_millis() as u64
    }

    pub fn default_weight(&self) -> u64 {
        self.weight.unwrap_or(1)
    }

    /// Validate and return the options, mapping failures to a configuration error.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

fn validate_interval(interval: &Duration) -> std::result::Result<(), ValidationError> {
    // Sub-millisecond intervals would round to zero in the refill and decay math
    if interval.as_millis() == 0 {
        let mut err = ValidationError::new("interval");
        err.message = Some("interval must be at least 1ms".into());
        return Err(err);
    }
    Ok(())
}

/// Token bucket options: the shared budget plus a refill rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TokenBucketOptions {
    #[serde(flatten)]
    #[validate(nested)]
    pub limiter: LimiterOptions,

    /// Tokens added per elapsed interval
    #[validate(range(min = 1, message = "refill must be greater than 0"))]
    pub refill: u64,
}

impl TokenBucketOptions {
    pub fn new(capacity: u64, interval: Duration, refill: u64) -> Self {
        Self {
            limiter: LimiterOptions::new(capacity, interval),
            refill,
        }
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.limiter.weight = Some(weight);
        self
    }

    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}
