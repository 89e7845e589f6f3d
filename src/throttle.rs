//! Adaptive multi-bucket throttle (C3).
//!
//! Mirrors the Mutex-protected token bucket shape used throughout the
//! corpus (a `lastTick` plus fractional `tokens`, refilled linearly on each
//! access) but implements the exact multiplicative rate-adjustment-factor
//! feedback this pipeline specifies, rather than a capacity-halving scheme.

use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};

/// A single rate limit: capacity plus linear refill.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_tick: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_tick: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
            self.last_tick = now;
        }
    }

    /// Returns the delay until `n` tokens are available, consuming them
    /// immediately (the caller is expected to wait the returned delay before
    /// actually using the tokens, matching `popBatch`-then-sleep callers).
    fn consume(&mut self, n: f64, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            return Duration::ZERO;
        }
        let deficit = n - self.tokens;
        let wait_secs = if self.refill_per_second > 0.0 {
            deficit / self.refill_per_second
        } else {
            f64::INFINITY
        };
        // Tokens become available at `now + wait`; treat them as spent now so
        // a burst of concurrent callers doesn't all compute the same delay.
        self.tokens = 0.0;
        Duration::from_secs_f64(wait_secs.max(0.0))
    }
}

/// Jitter applied to a throttle delay before the caller sleeps.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Default jitter source backed by the thread-local RNG.
#[derive(Debug, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

struct Inner {
    buckets: Vec<TokenBucket>,
    factor: f64,
    consecutive_errors: u32,
}

/// Tuning parameters for [`AdaptiveThrottle`], mapping to the `BackoffFactor`
/// / `RecoveryFactor` / `MinRateAdjustmentFactor` / `JittingFactor`
/// configuration surface entries.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub backoff_factor: f64,
    pub recovery_factor: f64,
    pub min_rate_adjustment_factor: f64,
    pub jitting_factor: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            backoff_factor: 0.5,
            recovery_factor: 0.5,
            min_rate_adjustment_factor: 1.0 / 8.0,
            jitting_factor: 0.1,
        }
    }
}

/// An ordered set of token buckets plus the rate-adjustment factor, per
/// spec §3/§4.2.
pub struct AdaptiveThrottle {
    inner: Mutex<Inner>,
    config: ThrottleConfig,
    jitter: Box<dyn JitterSource>,
}

impl AdaptiveThrottle {
    /// `buckets` is an ordered list of `(capacity, refill_per_second)`; the
    /// order must match the resource-amount vector passed to [`delay_for`].
    pub fn new(buckets: Vec<(f64, f64)>, config: ThrottleConfig) -> Self {
        Self::with_jitter(buckets, config, Box::new(ThreadRngJitter))
    }

    pub fn with_jitter(
        buckets: Vec<(f64, f64)>,
        config: ThrottleConfig,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        let buckets = buckets
            .into_iter()
            .map(|(cap, refill)| TokenBucket::new(cap, refill))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                buckets,
                factor: 1.0,
                consecutive_errors: 0,
            }),
            config,
            jitter,
        }
    }

    /// Delay for a call consuming `amounts[i]` of bucket `i`: the max
    /// per-bucket future-availability delay, divided by the current
    /// rate-adjustment factor, with multiplicative jitter applied.
    pub fn delay_for(&self, amounts: &[f64]) -> Duration {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        assert_eq!(
            amounts.len(),
            inner.buckets.len(),
            "resource-amount vector must match bucket order"
        );

        let mut max_delay = Duration::ZERO;
        for (bucket, &n) in inner.buckets.iter_mut().zip(amounts) {
            let d = bucket.consume(n, now);
            if d > max_delay {
                max_delay = d;
            }
        }
        let factor = inner.factor;
        drop(inner);

        let stretched = max_delay.as_secs_f64() / factor;
        let jitter = 1.0 + self.jitter.sample() * self.config.jitting_factor;
        Duration::from_secs_f64((stretched * jitter).max(0.0))
    }

    /// Record a successful call: factor divided by `recoveryFactor`, clamped
    /// to 1.0; `consecutiveErrors` reset.
    pub fn set_success(&self) {
        let mut inner = self.inner.lock();
        inner.factor = (inner.factor / self.config.recovery_factor).min(1.0);
        inner.consecutive_errors = 0;
    }

    /// Record a failed call: factor multiplied by `backoffFactor`, floored
    /// at `minRateAdjustmentFactor`; `consecutiveErrors` incremented.
    pub fn set_error(&self) {
        let mut inner = self.inner.lock();
        inner.factor = (inner.factor * self.config.backoff_factor)
            .max(self.config.min_rate_adjustment_factor);
        inner.consecutive_errors += 1;
    }

    pub fn rate_adjustment_factor(&self) -> f64 {
        self.inner.lock().factor
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().consecutive_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedJitter(f64);
    impl JitterSource for FixedJitter {
        fn sample(&self) -> f64 {
            self.0
        }
    }

    fn throttle_no_jitter(buckets: Vec<(f64, f64)>, config: ThrottleConfig) -> AdaptiveThrottle {
        AdaptiveThrottle::with_jitter(buckets, config, Box::new(FixedJitter(0.0)))
    }

    #[test]
    fn factor_stays_within_floor_and_one() {
        let throttle = throttle_no_jitter(vec![(10.0, 1.0)], ThrottleConfig::default());
        for _ in 0..20 {
            throttle.set_error();
        }
        assert!(throttle.rate_adjustment_factor() >= 1.0 / 8.0);
        throttle.set_success();
        assert!(throttle.rate_adjustment_factor() <= 1.0);
    }

    #[test]
    fn backoff_matches_power_of_two_formula() {
        let throttle = throttle_no_jitter(
            vec![(10.0, 1.0)],
            ThrottleConfig {
                backoff_factor: 0.5,
                recovery_factor: 0.5,
                min_rate_adjustment_factor: 1.0 / 8.0,
                jitting_factor: 0.0,
            },
        );
        for k in 1..=4 {
            throttle.set_error();
            let expected = (1.0f64 / 8.0).max(2f64.powi(-k));
            assert!((throttle.rate_adjustment_factor() - expected).abs() < 1e-9);
        }
        // one success after 4 errors: factor goes from 1/8 to 1/4
        throttle.set_success();
        assert!((throttle.rate_adjustment_factor() - 0.25).abs() < 1e-9);
        assert_eq!(throttle.consecutive_errors(), 0);
    }

    #[test]
    fn delay_scales_inversely_with_factor() {
        let throttle = throttle_no_jitter(
            vec![(1.0, 1.0)],
            ThrottleConfig {
                backoff_factor: 0.5,
                recovery_factor: 0.5,
                min_rate_adjustment_factor: 1.0 / 8.0,
                jitting_factor: 0.0,
            },
        );
        // drain the single token so the next request must wait ~1s at factor 1.0
        let _ = throttle.delay_for(&[1.0]);
        for _ in 0..4 {
            throttle.set_error();
        }
        let delay = throttle.delay_for(&[1.0]);
        assert!(delay >= Duration::from_secs_f64(8.0 - 0.01));
    }

    #[test]
    fn zero_wait_when_tokens_available() {
        let throttle = throttle_no_jitter(vec![(10.0, 1.0)], ThrottleConfig::default());
        let d = throttle.delay_for(&[1.0]);
        assert_eq!(d, Duration::ZERO);
    }
}
