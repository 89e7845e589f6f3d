//! Network-availability gate: an external predicate consulted before each
//! submit. Shared across sinks, read-mostly.

use std::sync::Arc;
use std::time::Duration;

/// `canUpload(priority)`, consulted by the dispatcher before each submit.
pub trait NetworkGate: Send + Sync {
    fn can_upload(&self, priority: u8) -> bool;
}

/// A gate that always allows uploads, for embedders with no network-cost
/// awareness (e.g. running on an unmetered link).
#[derive(Debug, Default)]
pub struct AlwaysAllow;

impl NetworkGate for AlwaysAllow {
    fn can_upload(&self, _priority: u8) -> bool {
        true
    }
}

/// An `AtomicU8`-backed gate an embedder updates from its own network-state
/// monitor; uploads above the stored priority threshold proceed.
#[derive(Debug)]
pub struct PriorityThresholdGate {
    min_allowed_priority: std::sync::atomic::AtomicU8,
}

impl PriorityThresholdGate {
    pub fn new(min_allowed_priority: u8) -> Arc<Self> {
        Arc::new(Self {
            min_allowed_priority: std::sync::atomic::AtomicU8::new(min_allowed_priority),
        })
    }

    pub fn set_min_allowed_priority(&self, priority: u8) {
        self.min_allowed_priority
            .store(priority, std::sync::atomic::Ordering::Relaxed);
    }
}

impl NetworkGate for PriorityThresholdGate {
    fn can_upload(&self, priority: u8) -> bool {
        priority >= self.min_allowed_priority.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Blocks while `gate` reports "upload disallowed", polling every `poll`
/// (default 10s) and logging a rate-limited warning every `warn_every`
/// (default ~5 minutes). Wakes immediately on cancellation via
/// `tokio::select!` against the caller's stop signal.
pub async fn wait_until_allowed(
    gate: &dyn NetworkGate,
    priority: u8,
    poll: Duration,
    warn_every: Duration,
    cancelled: &tokio::sync::Notify,
) {
    let mut last_warned: Option<tokio::time::Instant> = None;
    while !gate.can_upload(priority) {
        let now = tokio::time::Instant::now();
        if last_warned.map(|t| now - t >= warn_every).unwrap_or(true) {
            tracing::warn!(priority, "upload disallowed by network gate, waiting");
            last_warned = Some(now);
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancelled.notified() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_immediately_when_allowed() {
        let gate = AlwaysAllow;
        let cancel = tokio::sync::Notify::new();
        wait_until_allowed(&gate, 5, Duration::from_millis(10), Duration::from_secs(1), &cancel).await;
    }

    #[tokio::test]
    async fn priority_threshold_gate_blocks_low_priority() {
        let gate = PriorityThresholdGate::new(10);
        assert!(!gate.can_upload(5));
        assert!(gate.can_upload(10));
        gate.set_min_allowed_priority(0);
        assert!(gate.can_upload(5));
    }

    #[tokio::test]
    async fn cancellation_wakes_wait_immediately() {
        let gate = PriorityThresholdGate::new(100);
        let cancel = Arc::new(tokio::sync::Notify::new());
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            wait_until_allowed(
                gate.as_ref(),
                0,
                Duration::from_secs(30),
                Duration::from_secs(300),
                &cancel_clone,
            )
            .await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.notify_one();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("wait should return promptly on cancellation")
            .unwrap();
    }
}
