//! Runtime tunables with document-independent defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Full jitter: each delay is drawn uniformly from [0, backoff].
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Backoff before the given retry attempt (0-based), before jitter.
    #[must_use]
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = self.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = ((self.initial_delay_ms as f64) * exp) as u64;
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

/// Interpreter configuration left open by the document format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// In-flight messages per step when the step declares none.
    pub default_concurrency: usize,
    /// Inter-step buffer capacity = factor × concurrency.
    pub buffer_factor: usize,
    /// Default batch size for batch-capable steps.
    pub default_batch_size: usize,
    /// Tool-call round bound for agents.
    pub agent_max_iterations: usize,
    /// Seconds a cached client survives since last use.
    pub client_ttl_secs: u64,
    pub retry: RetryOptions,
    /// Per-step dispatch deadline.
    pub step_timeout_ms: Option<u64>,
    /// Whole-flow deadline.
    pub flow_timeout_ms: Option<u64>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            buffer_factor: 2,
            default_batch_size: 16,
            agent_max_iterations: 8,
            client_ttl_secs: 15 * 60,
            retry: RetryOptions::default(),
            step_timeout_ms: None,
            flow_timeout_ms: None,
        }
    }
}

impl RuntimeOptions {
    #[must_use]
    pub fn client_ttl(&self) -> Duration {
        Duration::from_secs(self.client_ttl_secs)
    }

    /// Effective concurrency for a step.
    #[must_use]
    pub fn concurrency_for(&self, declared: Option<usize>) -> usize {
        declared.unwrap_or(self.default_concurrency).max(1)
    }

    /// Inter-step buffer capacity for a step.
    #[must_use]
    pub fn buffer_for(&self, declared_concurrency: Option<usize>) -> usize {
        (self.concurrency_for(declared_concurrency) * self.buffer_factor).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryOptions::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(200));
        assert_eq!(retry.backoff(1), Duration::from_millis(400));
        assert_eq!(retry.backoff(10), Duration::from_millis(10_000));
    }

    #[test]
    fn defaults_match_contract() {
        let options = RuntimeOptions::default();
        assert_eq!(options.default_concurrency, 5);
        assert_eq!(options.buffer_for(None), 10);
        assert_eq!(options.agent_max_iterations, 8);
        assert_eq!(options.client_ttl(), Duration::from_secs(900));
    }
}
