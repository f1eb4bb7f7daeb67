use thiserror::Error;

/// Errors raised by policies, stores and the composite limiter.
///
/// A denied request is not an error: `check` returns [`crate::DENIED`] for it.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Options failed validation while a policy was being constructed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Environment configuration could not be loaded.
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A distributed policy was used before `setup()` or after `teardown()`.
    #[error("Redis connection not established")]
    NotConnected,

    #[error("Internal error: {0}")]
    Internal(String),

    /// Failure of one policy inside a composite limiter.
    #[error("Policy #{index} failed: {source}")]
    Policy {
        index: usize,
        #[source]
        source: Box<RateLimitError>,
    },

    /// Several policies of a composite limiter failed in the same phase.
    #[error("{} policies failed", .failures.len())]
    Multiple { failures: Vec<RateLimitError> },
}

impl RateLimitError {
    /// True for errors caused by invalid options or environment settings.
    pub fn is_configuration(&self) -> bool {
        match self {
            RateLimitError::Configuration(_) | RateLimitError::Environment(_) => true,
            RateLimitError::Policy { source, .. } => source.is_configuration(),
            RateLimitError::Multiple { failures } => failures.iter().any(|e| e.is_configuration()),
            _ => false,
        }
    }

    /// True for errors raised by the backing store.
    pub fn is_backend(&self) -> bool {
        match self {
            RateLimitError::Redis(_) | RateLimitError::NotConnected => true,
            RateLimitError::Policy { source, .. } => source.is_backend(),
            RateLimitError::Multiple { failures } => failures.iter().any(|e| e.is_backend()),
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for RateLimitError {
    fn from(err: validator::ValidationErrors) -> Self {
        RateLimitError::Configuration(err.to_string())
    }
}

impl From<envconfig::Error> for RateLimitError {
    fn from(err: envconfig::Error) -> Self {
        RateLimitError::Environment(err.to_string())
    }
}

impl RateLimitError {
    /// Collapse per-policy failures into one error, keeping a lone failure as-is.
    pub(crate) fn collect(mut failures: Vec<RateLimitError>) -> Option<RateLimitError> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(RateLimitError::Multiple { failures }),
        }
    }
}

pub type Result<T> = std::result::Result<T, RateLimitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_distinguishable() {
        let config = RateLimitError::Configuration("capacity: must be positive".to_string());
        assert!(config.is_configuration());
        assert!(!config.is_backend());

        let backend = RateLimitError::NotConnected;
        assert!(backend.is_backend());
        assert!(!backend.is_configuration());
    }

    #[test]
    fn test_policy_error_keeps_inner_kind() {
        let err = RateLimitError::Policy {
            index: 2,
            source: Box::new(RateLimitError::NotConnected),
        };
        assert!(err.is_backend());
        assert_eq!(
            err.to_string(),
            "Policy #2 failed: Redis connection not established"
        );
    }

    #[test]
    fn test_collect_failures() {
        assert!(RateLimitError::collect(Vec::new()).is_none());

        let single = RateLimitError::collect(vec![RateLimitError::NotConnected]).unwrap();
        assert!(matches!(single, RateLimitError::NotConnected));

        let multiple = RateLimitError::collect(vec![
            RateLimitError::Internal("lock".to_string()),
            RateLimitError::NotConnected,
        ])
        .unwrap();
        assert!(multiple.is_backend());
        assert_eq!(
            multiple.to_string(),
            "2 policies failed"
        );
    }
}
