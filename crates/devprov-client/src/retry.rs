//! Retry and polling policy.

use std::time::Duration;

use rand::Rng;

use crate::config::ProvisioningConfig;
use crate::error::ProvisioningError;

/// Decides whether and how long to wait before retrying or re-polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    default_poll_interval: Duration,
    min_poll_delay: Duration,
    max_delay: Duration,
    max_poll_attempts: u32,
}

impl RetryPolicy {
    /// Policy with budgets and delays from `config`.
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            default_poll_interval: Duration::from_millis(config.default_poll_interval_ms),
            min_poll_delay: Duration::from_millis(config.min_poll_delay_ms),
            max_delay: Duration::from_millis(config.max_poll_delay_ms),
            max_poll_attempts: config.max_poll_attempts,
        }
    }

    /// Retries allowed per protocol step.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Status polls allowed per registration.
    pub fn max_poll_attempts(&self) -> u32 {
        self.max_poll_attempts
    }

    /// Upper bound on any single wait.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether `err` is transient; budget not considered.
    pub fn is_retryable(&self, err: &ProvisioningError) -> bool {
        err.is_retryable()
    }

    /// Whether a step that failed with `err` after `retries` retries may run again.
    pub fn should_retry(&self, err: &ProvisioningError, retries: u32) -> bool {
        self.is_retryable(err) && retries < self.max_retries
    }

    /// Backoff before retry number `attempt` (1-based) of a failed step.
    ///
    /// A service hint is capped and jittered by ±10%; otherwise exponential
    /// backoff with full jitter. Never exceeds the cap.
    pub fn next_delay(&self, attempt: u32, service_hint: Option<Duration>) -> Duration {
        let mut rng = rand::thread_rng();

        let delay = match service_hint {
            Some(hint) => {
                let base_ms = hint.min(self.max_delay).as_millis() as u64;
                let jitter_factor: f64 = rng.gen_range(0.9_f64..=1.1_f64);
                let jittered_ms = ((base_ms as f64) * jitter_factor).round() as u64;
                Duration::from_millis(jittered_ms.max(100))
            }
            None => {
                let shift = attempt.saturating_sub(1).min(16);
                let backoff = self
                    .base_delay
                    .saturating_mul(1u32 << shift)
                    .min(self.max_delay);
                let jittered_ms = rng.gen_range(0..=backoff.as_millis() as u64);
                Duration::from_millis(jittered_ms.max(10))
            }
        };

        delay.min(self.max_delay)
    }

    /// Delay before a status poll: the service hint, or the default
    /// interval, clamped to `[floor, cap]`.
    pub fn poll_delay(&self, service_hint: Option<Duration>) -> Duration {
        service_hint
            .unwrap_or(self.default_poll_interval)
            .max(self.min_poll_delay)
            .min(self.max_delay)
    }

    /// Fresh poll delay sequence.
    pub fn poll_backoff(&self) -> PollBackoff {
        PollBackoff {
            policy: self.clone(),
            last: None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProvisioningConfig::default())
    }
}

/// Poll delay sequence of one registration; non-decreasing and capped.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    policy: RetryPolicy,
    last: Option<Duration>,
}

impl PollBackoff {
    /// Delay before the next poll; never shorter than the previous one.
    pub fn next(&mut self, service_hint: Option<Duration>) -> Duration {
        let mut delay = self.policy.poll_delay(service_hint);
        if let Some(last) = self.last {
            delay = delay.max(last);
        }
        self.last = Some(delay);
        delay
    }
}
