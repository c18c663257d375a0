use apphub_core::{AppError, AppResult};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on step retry attempts.
pub const RETRY_MAX_ATTEMPTS: u32 = 10;
/// Upper bound on any configured retry delay (24 hours).
pub const RETRY_MAX_DELAY_MS: u64 = 86_400_000;

/// Delay growth strategy between step attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry immediately.
    None,
    /// Constant delay between attempts.
    Fixed,
    /// Delay doubles per attempt up to the configured maximum.
    Exponential,
}

/// Jitter applied to a computed retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// Use the computed delay unchanged.
    None,
    /// Uniform delay in `[0, computed]`.
    Full,
    /// Half the computed delay plus uniform jitter over the other half.
    Equal,
}

/// Per-step retry policy embedded in workflow definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first one.
    pub max_attempts: u32,
    /// Delay growth strategy.
    pub strategy: RetryStrategy,
    /// Base delay before the first retry.
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Cap applied to exponential growth.
    #[serde(default)]
    pub max_delay_ms: u64,
    /// Jitter applied to every computed delay.
    #[serde(default = "JitterMode::default")]
    pub jitter: JitterMode,
}

impl JitterMode {
    fn default() -> Self {
        Self::None
    }
}

impl RetryPolicy {
    /// Validates policy bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_attempts == 0 {
            return Err(AppError::Validation(
                "retry policy max_attempts must be greater than zero".to_owned(),
            ));
        }

        if self.max_attempts > RETRY_MAX_ATTEMPTS {
            return Err(AppError::Validation(format!(
                "retry policy max_attempts must be less than or equal to {RETRY_MAX_ATTEMPTS}"
            )));
        }

        if self.initial_delay_ms > RETRY_MAX_DELAY_MS {
            return Err(AppError::Validation(format!(
                "retry policy initial_delay_ms must be less than or equal to {RETRY_MAX_DELAY_MS}"
            )));
        }

        if self.max_delay_ms > RETRY_MAX_DELAY_MS {
            return Err(AppError::Validation(format!(
                "retry policy max_delay_ms must be less than or equal to {RETRY_MAX_DELAY_MS}"
            )));
        }

        Ok(())
    }

    /// Returns whether another attempt is allowed after `attempt` failed.
    #[must_use]
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Computes the delay before the attempt following failed attempt `attempt`.
    #[must_use]
    pub fn delay_ms_for_attempt(&self, attempt: u32, rng: &mut impl Rng) -> u64 {
        let attempt = attempt.max(1);
        let computed = match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(63);
                let grown = self
                    .initial_delay_ms
                    .saturating_mul(1_u64.checked_shl(exponent).unwrap_or(u64::MAX));
                let cap = if self.max_delay_ms == 0 {
                    RETRY_MAX_DELAY_MS
                } else {
                    self.max_delay_ms
                };
                grown.min(cap)
            }
        };

        match self.jitter {
            JitterMode::None => computed,
            JitterMode::Full => {
                if computed == 0 {
                    0
                } else {
                    rng.gen_range(0..=computed)
                }
            }
            JitterMode::Equal => {
                let half = computed / 2;
                if half == 0 {
                    computed
                } else {
                    half + rng.gen_range(0..=computed - half)
                }
            }
        }
    }
}

/// Exponential backoff configuration for scheduled queue retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay for the first attempt.
    pub base_ms: u64,
    /// Multiplier applied per subsequent attempt.
    pub factor: f64,
    /// Upper bound on the computed delay before jitter.
    pub max_ms: u64,
    /// Uniform jitter ratio applied as `computed * (1 +/- ratio)`.
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 5_000,
            factor: 2.0,
            max_ms: 300_000,
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Validates configuration bounds.
    pub fn validate(&self) -> AppResult<()> {
        if self.base_ms == 0 {
            return Err(AppError::Validation(
                "backoff base_ms must be greater than zero".to_owned(),
            ));
        }

        if self.factor < 1.0 {
            return Err(AppError::Validation(
                "backoff factor must be at least 1.0".to_owned(),
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(AppError::Validation(
                "backoff jitter_ratio must be between 0.0 and 1.0".to_owned(),
            ));
        }

        Ok(())
    }

    /// Computes the delay for attempt `attempt` (1-based), jitter included.
    #[must_use]
    pub fn delay_ms_for_attempt(&self, attempt: u32, rng: &mut impl Rng) -> u64 {
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let grown = (self.base_ms as f64) * self.factor.powi(exponent);
        let capped = grown.min(self.max_ms as f64);

        if self.jitter_ratio <= 0.0 {
            return capped as u64;
        }

        let spread = capped * self.jitter_ratio;
        let jittered = capped + rng.gen_range(-spread..=spread);
        jittered.max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::{BackoffConfig, JitterMode, RetryPolicy, RetryStrategy};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn exponential_delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter: JitterMode::None,
        };

        let mut rng = rng();
        assert_eq!(policy.delay_ms_for_attempt(1, &mut rng), 1_000);
        assert_eq!(policy.delay_ms_for_attempt(2, &mut rng), 2_000);
        assert_eq!(policy.delay_ms_for_attempt(3, &mut rng), 4_000);
        assert_eq!(policy.delay_ms_for_attempt(4, &mut rng), 5_000);
    }

    #[test]
    fn fixed_strategy_uses_initial_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: 250,
            max_delay_ms: 0,
            jitter: JitterMode::None,
        };

        let mut rng = rng();
        assert_eq!(policy.delay_ms_for_attempt(1, &mut rng), 250);
        assert_eq!(policy.delay_ms_for_attempt(7, &mut rng), 250);
    }

    #[test]
    fn retry_policy_rejects_excess_attempts() {
        let policy = RetryPolicy {
            max_attempts: 11,
            strategy: RetryStrategy::None,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: JitterMode::None,
        };

        assert!(policy.validate().is_err());
        assert!(!policy.allows_retry(11));
    }

    #[test]
    fn backoff_respects_cap_without_jitter() {
        let config = BackoffConfig {
            base_ms: 1_000,
            factor: 2.0,
            max_ms: 3_000,
            jitter_ratio: 0.0,
        };

        let mut rng = rng();
        assert_eq!(config.delay_ms_for_attempt(1, &mut rng), 1_000);
        assert_eq!(config.delay_ms_for_attempt(2, &mut rng), 2_000);
        assert_eq!(config.delay_ms_for_attempt(3, &mut rng), 3_000);
        assert_eq!(config.delay_ms_for_attempt(10, &mut rng), 3_000);
    }

    proptest! {
        #[test]
        fn jittered_backoff_stays_within_bounds(attempt in 1_u32..12, seed in 0_u64..64) {
            let config = BackoffConfig {
                base_ms: 500,
                factor: 2.0,
                max_ms: 60_000,
                jitter_ratio: 0.25,
            };

            let mut rng = StdRng::seed_from_u64(seed);
            let delay = config.delay_ms_for_attempt(attempt, &mut rng) as f64;
            let raw = (500.0_f64 * 2.0_f64.powi(attempt as i32 - 1)).min(60_000.0);
            prop_assert!(delay >= raw * 0.75 - 1.0);
            prop_assert!(delay <= raw * 1.25 + 1.0);
        }

        #[test]
        fn full_jitter_never_exceeds_computed_delay(attempt in 1_u32..10, seed in 0_u64..64) {
            let policy = RetryPolicy {
                max_attempts: 10,
                strategy: RetryStrategy::Exponential,
                initial_delay_ms: 1_000,
                max_delay_ms: 30_000,
                jitter: JitterMode::Full,
            };

            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.delay_ms_for_attempt(attempt, &mut rng);
            let ceiling = 1_000_u64.saturating_mul(1 << (attempt - 1).min(63)).min(30_000);
            prop_assert!(delay <= ceiling);
        }
    }
}
