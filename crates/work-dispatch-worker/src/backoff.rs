use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule for retrying a failing operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_factor")]
        factor: u32,
        /// Add up to 10% random delay so a fleet does not retry in lockstep
        #[serde(default)]
        jitter: bool,
    },
}

fn default_factor() -> u32 {
    2
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            factor: default_factor(),
            jitter: false,
        }
    }

    /// Delay before retry number `attempt`, counting from 1
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential {
                initial_ms,
                max_ms,
                factor,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1);
                let scale = (factor.max(1) as u64).saturating_pow(exponent);
                let base = initial_ms.saturating_mul(scale).min(max_ms);
                let extra = if jitter && base >= 10 {
                    rand::thread_rng().gen_range(0..=base / 10)
                } else {
                    0
                };
                Duration::from_millis(base.saturating_add(extra).min(max_ms))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed { delay_ms: 10_000 }
    }
}

/// What the dispatch loop does when fetching from its source fails
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FetchErrorPolicy {
    /// Abort the loop with a fatal error
    #[default]
    FailFast,
    /// Log, wait out the backoff, and fetch again
    LogAndRetry {
        #[serde(default)]
        backoff: BackoffPolicy,
    },
}

impl FetchErrorPolicy {
    pub fn log_and_retry(backoff: BackoffPolicy) -> Self {
        FetchErrorPolicy::LogAndRetry { backoff }
    }
}
