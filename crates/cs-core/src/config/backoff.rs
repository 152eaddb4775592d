//! Reconnect backoff configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs_f64;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, and the value restored after a successful connect
    #[serde(with = "duration_secs_f64")]
    pub initial: Duration,

    /// Upper bound on the delay
    #[serde(with = "duration_secs_f64")]
    pub max: Duration,

    /// Growth factor applied on every scheduled retry
    pub multiplier: f64,

    /// Standard deviation of the Gaussian jitter, as a fraction of the delay
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(15),
            multiplier: 1.72,
            jitter: 0.12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial, Duration::from_secs_f64(1.0));
        assert_eq!(config.max, Duration::from_secs_f64(15.0));
        assert_eq!(config.multiplier, 1.72);
        assert_eq!(config.jitter, 0.12);
    }

    #[test]
    fn test_partial_override() {
        let config: BackoffConfig = toml::from_str("initial = 0.5\nmultiplier = 2.0").unwrap();
        assert_eq!(config.initial, Duration::from_millis(500));
        assert_eq!(config.multiplier, 2.0);
        assert_eq!(config.max, Duration::from_secs(15));
    }
}
