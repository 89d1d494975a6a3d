//! Retry backoff — how long a failed attempt waits before re-entering the queue.

use std::time::Duration;

use herald_core::config::RetryConfig;
use herald_core::{HeraldError, Result};

/// Growth curve of the retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = HeraldError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(HeraldError::Config(format!("unknown retry backoff: {other}"))),
        }
    }
}

/// Retry delay policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Requeue immediately, no delay.
    pub fn immediate() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Ok(Self {
            strategy: config.backoff.parse()?,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        })
    }

    /// Delay before the `retry`-th re-enqueue (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms.saturating_mul(retry as u64),
            BackoffStrategy::Exponential => {
                base_ms.saturating_mul(2u64.saturating_pow(retry - 1))
            }
        };
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}
