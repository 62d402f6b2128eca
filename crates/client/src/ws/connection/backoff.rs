//! Exponential reconnect backoff with per-instance jitter.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use super::options::ConnectionOptions;

const MAX_JITTER: f64 = 0.5;
/// Used when the configured minimum is zero.
const DEFAULT_MIN: Duration = Duration::from_millis(100);
/// Used when the configured maximum is zero.
const DEFAULT_MAX: Duration = Duration::from_secs(10);

/// Produces the delays between reconnect attempts.
///
/// The first delay is `min`. Every following delay targets `previous * factor`
/// and is moved by at most `jitter` of that growth step in either direction,
/// then clamped to `[min, max]`. With jitter capped at half the step the
/// sequence never decreases.
#[derive(Debug)]
pub struct Backoff {
    min: f64,
    max: f64,
    factor: f64,
    jitter: f64,
    previous: Option<f64>,
    rng: StdRng,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration, factor: f64, jitter: f64, seed: Option<u64>) -> Self {
        let min = if min.is_zero() { DEFAULT_MIN } else { min }.as_secs_f64();
        let max = if max.is_zero() { DEFAULT_MAX } else { max }
            .as_secs_f64()
            .max(min);
        let factor = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, MAX_JITTER) } else { 0.0 };
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            min,
            max,
            factor,
            jitter,
            previous: None,
            rng,
        }
    }

    pub fn from_options(opts: &ConnectionOptions) -> Self {
        Self::new(
            opts.reconnect_interval_min,
            opts.reconnect_interval_max,
            opts.reconnect_interval_factor,
            opts.reconnect_jitter,
            opts.jitter_seed,
        )
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.previous {
            None => self.min,
            Some(previous) => {
                let target = previous * self.factor;
                let spread = (target - previous) * self.jitter;
                let offset = if spread > 0.0 {
                    self.rng.gen_range(-spread..=spread)
                } else {
                    0.0
                };
                (target + offset).clamp(self.min, self.max)
            }
        };
        self.previous = Some(delay);
        Duration::from_secs_f64(delay)
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bounds_fall_back_to_defaults() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO, 1.5, 0.5, Some(1));
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();

        let min = DEFAULT_MIN.as_secs_f64();
        assert!((delays[0].as_secs_f64() - min).abs() < 1e-6);
        assert!(delays.iter().all(|d| d.as_secs_f64() > min - 1e-6 && *d <= DEFAULT_MAX));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.last().unwrap().as_secs_f64() > 2.0 * min);
    }

    #[test]
    fn zero_min_keeps_configured_max() {
        let mut backoff = Backoff::new(Duration::ZERO, secs(30.0), 2.0, 0.0, Some(1));
        let delays: Vec<_> = (0..12).map(|_| backoff.next_delay()).collect();

        assert!((delays[0].as_secs_f64() - DEFAULT_MIN.as_secs_f64()).abs() < 1e-6);
        assert_eq!(*delays.last().unwrap(), secs(30.0));
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn first_delay_is_min() {
        let mut backoff = Backoff::new(secs(2.0), secs(30.0), 1.5, 0.5, Some(7));
        assert_eq!(backoff.next_delay(), secs(2.0));
    }

    #[test]
    fn delays_grow_within_jitter_and_never_decrease() {
        let mut backoff = Backoff::new(secs(1.0), secs(60.0), 2.0, 0.5, Some(42));
        let mut previous = backoff.next_delay().as_secs_f64();

        for _ in 0..20 {
            let delay = backoff.next_delay().as_secs_f64();
            let target = previous * 2.0;
            let spread = (target - previous) * 0.5;

            assert!(delay >= previous, "{} < {}", delay, previous);
            assert!(delay <= 60.0);
            if target <= 60.0 - spread {
                assert!(delay >= target - spread - 1e-9 && delay <= target + spread + 1e-9);
            }
            previous = delay;
        }
        assert_eq!(previous, 60.0);
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Backoff::new(secs(0.5), secs(30.0), 1.5, 0.5, Some(1234));
        let mut b = Backoff::new(secs(0.5), secs(30.0), 1.5, 0.5, Some(1234));
        for _ in 0..10 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn factor_one_is_constant() {
        let mut backoff = Backoff::new(secs(3.0), secs(30.0), 1.0, 0.5, None);
        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), secs(3.0));
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(secs(1.0), secs(30.0), 2.0, 0.0, None);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), secs(4.0));
        backoff.reset();
        assert_eq!(backoff.next_delay(), secs(1.0));
    }
}
