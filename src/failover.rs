//! Failover controller (C6): primary/secondary backend client pair.

use crate::throttle::AdaptiveThrottle;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveClient {
    Primary,
    Secondary,
}

/// An inexpensive reachability probe against a backend, used for fail-back.
/// Must not throw into the dispatch loop: implementations return `false` on
/// any failure rather than propagating an error.
#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

struct State {
    active: ActiveClient,
    /// Primary is "down" until this instant; `None` means not marked down.
    primary_down_until: Option<Instant>,
    last_failover: Option<Instant>,
}

/// Keeps a primary/secondary backend client pair and arbitrates switching on
/// sustained failure, with a timed fail-back probe.
///
/// At most one client is "active" at any time; the inactive client is never
/// destroyed. Changing `active` is atomic with respect to submission because
/// [`active_client`] reads a single `RwLock` snapshot per call.
pub struct FailoverController {
    state: RwLock<State>,
    secondary_available: AtomicBool,
    failover_error_threshold: u32,
    reset_window: Duration,
}

impl FailoverController {
    pub fn new(has_secondary: bool, failover_error_threshold: u32, reset_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(State {
                active: ActiveClient::Primary,
                primary_down_until: None,
                last_failover: None,
            }),
            secondary_available: AtomicBool::new(has_secondary),
            failover_error_threshold,
            reset_window,
        })
    }

    pub fn active_client(&self) -> ActiveClient {
        self.state.read().active
    }

    pub fn last_failover(&self) -> Option<Instant> {
        self.state.read().last_failover
    }

    /// Called before each submit. Swaps the active client to the secondary
    /// if `throttle.consecutiveErrors` exceeds the configured threshold and
    /// the secondary is available; marks the primary down for
    /// `reset_window`.
    pub fn maybe_failover(&self, throttle: &AdaptiveThrottle) {
        if throttle.consecutive_errors() <= self.failover_error_threshold {
            return;
        }
        if !self.secondary_available.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state.write();
        if state.active == ActiveClient::Secondary {
            return;
        }
        state.active = ActiveClient::Secondary;
        state.primary_down_until = Some(Instant::now() + self.reset_window);
        state.last_failover = Some(Instant::now());
        tracing::warn!(
            consecutive_errors = throttle.consecutive_errors(),
            "failing over to secondary backend"
        );
    }

    /// Whether the primary's reset window has elapsed (informational; the
    /// actual swap-back only happens via [`run_failback_probe`]).
    pub fn primary_reset_window_elapsed(&self) -> bool {
        match self.state.read().primary_down_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Run one fail-back probe cycle against `probe`. On success, swaps the
    /// active client back to the primary. Never propagates probe errors.
    pub async fn run_failback_probe(&self, probe: &dyn HealthProbe) {
        if self.active_client() != ActiveClient::Secondary {
            return;
        }
        if probe.is_reachable().await {
            let mut state = self.state.write();
            state.active = ActiveClient::Primary;
            state.primary_down_until = None;
            tracing::info!("fail-back probe succeeded, reverting to primary backend");
        }
    }

    /// Spawn the periodic fail-back timer task (default:
    /// `maxFailbackRetryIntervalMinutes`). Aborting the returned handle stops
    /// probing.
    pub fn spawn_failback_timer(
        self: &Arc<Self>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.run_failback_probe(probe.as_ref()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::ThrottleConfig;

    struct AlwaysUp;
    #[async_trait::async_trait]
    impl HealthProbe for AlwaysUp {
        async fn is_reachable(&self) -> bool {
            true
        }
    }

    struct AlwaysDown;
    #[async_trait::async_trait]
    impl HealthProbe for AlwaysDown {
        async fn is_reachable(&self) -> bool {
            false
        }
    }

    #[test]
    fn failover_swaps_after_threshold() {
        let throttle = AdaptiveThrottle::new(vec![(10.0, 1.0)], ThrottleConfig::default());
        let controller = FailoverController::new(true, 4, Duration::from_secs(60));

        for _ in 0..4 {
            throttle.set_error();
            controller.maybe_failover(&throttle);
        }
        assert_eq!(controller.active_client(), ActiveClient::Primary);

        throttle.set_error();
        controller.maybe_failover(&throttle);
        assert_eq!(controller.active_client(), ActiveClient::Secondary);
    }

    #[test]
    fn no_failover_without_secondary() {
        let throttle = AdaptiveThrottle::new(vec![(10.0, 1.0)], ThrottleConfig::default());
        let controller = FailoverController::new(false, 1, Duration::from_secs(60));
        for _ in 0..5 {
            throttle.set_error();
        }
        controller.maybe_failover(&throttle);
        assert_eq!(controller.active_client(), ActiveClient::Primary);
    }

    #[tokio::test]
    async fn failback_probe_reverts_on_success() {
        let throttle = AdaptiveThrottle::new(vec![(10.0, 1.0)], ThrottleConfig::default());
        let controller = FailoverController::new(true, 1, Duration::from_secs(60));
        for _ in 0..2 {
            throttle.set_error();
        }
        controller.maybe_failover(&throttle);
        assert_eq!(controller.active_client(), ActiveClient::Secondary);

        controller.run_failback_probe(&AlwaysDown).await;
        assert_eq!(controller.active_client(), ActiveClient::Secondary);

        controller.run_failback_probe(&AlwaysUp).await;
        assert_eq!(controller.active_client(), ActiveClient::Primary);
    }
}
