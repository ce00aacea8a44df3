use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay policy between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every attempt.
    Fixed {
        #[serde(default = "default_delay_ms")]
        delay_ms: u64,
    },
    /// Delay grows by `factor` per attempt, capped at `max_ms`.
    Exponential {
        #[serde(default = "default_delay_ms")]
        initial_ms: u64,
        #[serde(default = "default_factor")]
        factor: f64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
    },
}

const fn default_delay_ms() -> u64 {
    2_000
}

const fn default_factor() -> f64 {
    2.0
}

const fn default_max_ms() -> u64 {
    30_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(default_delay_ms())
    }
}

impl BackoffPolicy {
    pub const fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }

    pub fn exponential(initial_ms: u64, factor: f64) -> Self {
        let initial_ms = if initial_ms == 0 {
            default_delay_ms()
        } else {
            initial_ms
        };
        let factor = if factor <= 0.0 {
            default_factor()
        } else {
            factor
        };
        Self::Exponential {
            initial_ms,
            factor,
            max_ms: default_max_ms(),
        }
    }

    pub fn with_max_ms(self, max_ms: u64) -> Self {
        match self {
            Self::Exponential {
                initial_ms, factor, ..
            } => Self::Exponential {
                initial_ms,
                factor,
                max_ms: max_ms.max(1),
            },
            fixed => fixed,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_ms,
                factor,
                max_ms,
            } => {
                let exp = factor.powi(attempt.saturating_sub(1) as i32);
                let base = (*initial_ms as f64 * exp).round() as u64;
                Duration::from_millis(base.min((*max_ms).max(1)))
            }
        }
    }
}
