//! Backoff strategies for transient failures: SMTP 4xx, lock
//! contention, NNTP connection resets.
//!
//! Permanent failures (SMTP 5xx, parse errors) never go through here —
//! per the error taxonomy, those are shunted or scored, not retried.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Immediate,
    #[default]
    Exponential,
    Linear,
    Constant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(4 * 3600)
}

fn default_jitter() -> f64 {
    0.3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Delay before the next attempt (1-indexed).
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt),
        BackoffStrategy::Constant => config.base_delay,
    };
    let capped = delay.min(config.max_delay);
    if config.jitter > 0.0 { apply_jitter(capped, config.jitter) } else { capped }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;
    let range = 2.0 * jitter;
    let mut rng = rand::thread_rng();
    let random: f64 = rng.r#gen();
    let factor = 1.0 - jitter + random * range;
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

/// Has this entry exhausted its retry budget?
pub fn attempts_exhausted(config: &RetryConfig, attempt: u32) -> bool {
    attempt >= config.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_has_zero_delay() {
        let config = RetryConfig { strategy: BackoffStrategy::Immediate, jitter: 0.0, ..RetryConfig::default() };
        assert_eq!(calculate_delay(&config, 1), Duration::ZERO);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let config = RetryConfig {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(calculate_delay(&config, 4), Duration::from_secs(8));
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(8));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig {
            strategy: BackoffStrategy::Constant,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
            max_attempts: 10,
        };
        for _ in 0..50 {
            let d = calculate_delay(&config, 1);
            assert!(d >= Duration::from_millis(5000) && d <= Duration::from_millis(15000));
        }
    }

    #[test]
    fn attempts_exhausted_boundary() {
        let config = RetryConfig { max_attempts: 3, ..RetryConfig::default() };
        assert!(!attempts_exhausted(&config, 2));
        assert!(attempts_exhausted(&config, 3));
    }
}
