//! Rate-limited logging helper (§7: "one per 5 minutes per logical site").

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Gates a log site so it fires at most once per `interval`, regardless of
/// how often the call site is hit. Not a tracing layer or aggregator; just
/// the per-site throttle the error-handling design calls for.
pub struct RateLimitedLog {
    interval: Duration,
    last_emitted: Mutex<Option<Instant>>,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: Mutex::new(None),
        }
    }

    /// Returns `true` if the caller should log now (and records that it did).
    pub fn should_emit(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_emitted.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Emits `tracing::warn!` through a [`RateLimitedLog`], mirroring the
/// "rate-limited warning" propagation policy for recoverable errors.
#[macro_export]
macro_rules! warn_rate_limited {
    ($gate:expr, $($arg:tt)+) => {
        if $gate.should_emit() {
            tracing::warn!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_emits_once_per_interval() {
        let gate = RateLimitedLog::new(Duration::from_secs(300));
        assert!(gate.should_emit());
        assert!(!gate.should_emit());
    }

    #[test]
    fn emits_again_after_interval_elapses() {
        let gate = RateLimitedLog::new(Duration::from_millis(5));
        assert!(gate.should_emit());
        std::thread::sleep(Duration::from_millis(10));
        assert!(gate.should_emit());
    }
}
