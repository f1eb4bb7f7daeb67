use futures::future::join_all;
use std::sync::Arc;

use crate::algorithms::{Policy, Remaining};
use crate::error::{RateLimitError, Result};

/// Runs several independent policies against the same subject.
///
/// Every phase fans out to all policies concurrently and waits for all of
/// them, so one failing policy never hides the outcome of the others.
#[derive(Clone, Default)]
pub struct RateLimiter {
    policies: Vec<Arc<dyn Policy>>,
}

impl RateLimiter {
    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        Self { policies }
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Prepare every policy's backend resources.
    pub async fn setup(&self) -> Result<()> {
        let outcomes = join_all(self.policies.iter().map(|policy| policy.setup())).await;
        Self::surface("setup", outcomes)
    }

    /// Release every policy's backend resources.
    pub async fn teardown(&self) -> Result<()> {
        let outcomes = join_all(self.policies.iter().map(|policy| policy.teardown())).await;
        Self::surface("teardown", outcomes)
    }

    /// Check `subject` against every policy, returning each outcome in policy order.
    pub async fn check(&self, subject: &str, weight: Option<u64>) -> Vec<Result<Remaining>> {
        let outcomes = join_all(
            self.policies
                .iter()
                .map(|policy| policy.check(subject, weight, None)),
        )
        .await;

        outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.map_err(|e| {
                    tracing::warn!(subject, policy = index, error = %e, "Rate limit policy failed");
                    RateLimitError::Policy {
                        index,
                        source: Box::new(e),
                    }
                })
            })
            .collect()
    }

    /// Check `subject` and combine the outcomes into a single verdict.
    ///
    /// Fails if any policy failed, after all of them have completed.
    pub async fn verdict(&self, subject: &str, weight: Option<u64>) -> Result<Verdict> {
        let mut remaining = Vec::with_capacity(self.policies.len());
        let mut failures = Vec::new();

        for outcome in self.check(subject, weight).await {
            match outcome {
                Ok(value) => remaining.push(value),
                Err(e) => failures.push(e),
            }
        }

        if let Some(err) = RateLimitError::collect(failures) {
            return Err(err);
        }

        let verdict = Verdict { remaining };
        if !verdict.is_allowed() {
            tracing::debug!(subject, remaining = ?verdict.remaining, "Request denied");
        }
        Ok(verdict)
    }

    fn surface(phase: &str, outcomes: Vec<Result<()>>) -> Result<()> {
        let failures = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.err().map(|e| (index, e)))
            .map(|(index, e)| {
                tracing::warn!(phase, policy = index, error = %e, "Rate limit policy failed");
                RateLimitError::Policy {
                    index,
                    source: Box::new(e),
                }
            })
            .collect();

        match RateLimitError::collect(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct RateLimiterBuilder {
    policies: Vec<Arc<dyn Policy>>,
}

impl RateLimiterBuilder {
    pub fn policy<P: Policy + 'static>(mut self, policy: P) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    pub fn shared_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter::new(self.policies)
    }
}

/// Remaining values of every policy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub remaining: Vec<Remaining>,
}

impl Verdict {
    /// Admitted only if no policy denied the request.
    pub fn is_allowed(&self) -> bool {
        self.remaining.iter().all(|value| *value >= 0)
    }

    /// Tightest remaining value, or `None` with no policies.
    pub fn min_remaining(&self) -> Option<Remaining> {
        self.remaining.iter().copied().min()
    }
}
