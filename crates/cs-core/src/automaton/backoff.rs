//! Exponential backoff for reconnection

use rand::Rng;
use std::f64::consts::TAU;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff with Gaussian jitter for reconnection attempts
///
/// The base delay grows by `multiplier` on every call to
/// [`next_delay`](Self::next_delay) and is capped at `max`. The returned
/// delay is drawn from a normal distribution centred on the base with a
/// standard deviation of `jitter * base`, clamped to `[0, max]`. The base
/// itself is never perturbed, so the mean sequence is non-decreasing.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay restored by `reset`
    initial: f64,
    /// Current base delay in seconds
    current: f64,
    /// Maximum delay in seconds
    max: f64,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (standard deviation relative to the base)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial: initial.as_secs_f64(),
            current: initial.as_secs_f64(),
            max: max.as_secs_f64(),
            multiplier,
            jitter: jitter.max(0.0),
        }
    }

    /// Current base delay, before jitter
    pub fn base(&self) -> Duration {
        Duration::from_secs_f64(self.current)
    }

    /// Advance the base and draw the next delay
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Advance the base and draw the next delay from a given generator
    pub fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        self.current = (self.current * self.multiplier).min(self.max);

        let sampled = self.current + self.jitter * self.current * standard_normal(rng);
        Duration::from_secs_f64(sampled.clamp(0.0, self.max))
    }

    /// Reset the backoff to its initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Box-Muller draw from N(0, 1)
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // gen() is in [0, 1); flip it so ln never sees zero
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn defaults() -> ExponentialBackoff {
        ExponentialBackoff::from_config(&BackoffConfig::default())
    }

    #[test]
    fn test_base_sequence_without_jitter() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(15), 1.72, 0.0);

        let delays: Vec<f64> = (0..6).map(|_| backoff.next_delay().as_secs_f64()).collect();
        let expected = [1.72, 2.9584, 5.088448, 8.75213056, 15.0, 15.0];
        for (got, want) in delays.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "got {} want {}", got, want);
        }
    }

    #[test]
    fn test_base_is_non_decreasing_and_capped() {
        let mut backoff = defaults();
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous = backoff.base();
        for _ in 0..50 {
            let delay = backoff.next_delay_with(&mut rng);
            assert!(delay <= Duration::from_secs(15));
            assert!(backoff.base() >= previous);
            previous = backoff.base();
        }
        assert_eq!(backoff.base(), Duration::from_secs(15));
    }

    #[test]
    fn test_jitter_spread() {
        let mut rng = StdRng::seed_from_u64(42);
        let samples: Vec<f64> = (0..2000)
            .map(|_| {
                let mut backoff = defaults();
                backoff.next_delay_with(&mut rng).as_secs_f64()
            })
            .collect();

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((mean - 1.72).abs() < 0.05, "mean {}", mean);
        assert!(samples.iter().any(|s| (s - 1.72).abs() > 0.01));
    }

    #[test]
    fn test_reset_restores_initial() {
        let mut backoff = defaults();
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.base() > Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.base(), Duration::from_secs(1));
    }
}
