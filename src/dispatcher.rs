//! Batch dispatcher (C4): pulls a batch, waits on throttle, checks the
//! network gate, submits to the backend, interprets the response, updates
//! the throttle, commits bookmarks or requeues.
//!
//! Grounded on the teacher's producer send-and-retry loop: batches are sent
//! outside any lock, failures drive bounded in-place retries, and the
//! per-attempt backoff shape (exponential with a small cap) mirrors the
//! teacher's sequence-gap retry.

use crate::backend::{BackendClient, SubmitOutcome};
use crate::bookmark::BookmarkCoordinator;
use crate::config::SinkConfig;
use crate::envelope::{Batch, Envelope, SizeOf};
use crate::error::DispatchError;
use crate::failover::{ActiveClient, FailoverController};
use crate::metrics::{MetricsCounters, MetricsSink};
use crate::network_gate::NetworkGate;
use crate::queue::{BatchCaps, TwoTierQueue};
use crate::telemetry::RateLimitedLog;
use crate::throttle::AdaptiveThrottle;
use parking_lot::Mutex as SyncMutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};

/// Invalid-sequence-token retries are free (don't count toward
/// `MaxAttempts`) but independently capped, per the decision recorded in
/// SPEC_FULL.md / DESIGN.md.
const MAX_FREE_TOKEN_RETRIES: u32 = 2;

/// Capacity of each per-worker sub-queue in the parallel-dispatcher
/// architecture (§4.3). Small by design: a sub-queue is meant to smooth
/// momentary imbalance between workers, not buffer real backlog — that's
/// what the shared two-tier queue is for.
pub(crate) const SUB_QUEUE_CAPACITY: usize = 4;

/// One batch handed to a worker's sub-queue, paired with the semaphore
/// permit reserving its slot. Dropping the permit (as soon as the item is
/// received) frees the slot for [`run_distributor`] to fill again.
type SubQueueItem<T> = (Batch<T>, OwnedSemaphorePermit);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl DispatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DispatcherState::Starting,
            1 => DispatcherState::Running,
            2 => DispatcherState::Draining,
            _ => DispatcherState::Stopped,
        }
    }
}

/// Cooperative stop signal shared between a sink and its dispatcher(s).
/// Every sleep and wait must observe it and wake immediately.
pub struct StopSignal {
    state: AtomicU8,
    notify: Notify,
    grace: Duration,
}

impl StopSignal {
    pub fn new(grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(0),
            notify: Notify::new(),
            grace,
        })
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Begin draining: stop accepting new batches, keep flushing queued and
    /// in-flight work until the grace deadline.
    pub fn request_drain(&self) {
        if self.state() == DispatcherState::Running {
            self.set_state(DispatcherState::Draining);
        }
        self.notify.notify_waiters();
    }

    pub fn notify(&self) -> &Notify {
        &self.notify
    }
}

/// Everything one sink instance exclusively owns: its dispatcher, throttle,
/// two-tier queue, active/inactive client pair, and failover timer.
pub struct Dispatcher<T, Req> {
    pub queue: Arc<TwoTierQueue<T>>,
    pub throttle: Arc<AdaptiveThrottle>,
    pub bookmark: Arc<BookmarkCoordinator>,
    pub failover: Arc<FailoverController>,
    pub primary_client: Arc<dyn BackendClient<T, Req>>,
    pub secondary_client: Option<Arc<dyn BackendClient<T, Req>>>,
    pub network_gate: Arc<dyn NetworkGate>,
    pub metrics_sink: Arc<dyn MetricsSink>,
    pub counters: MetricsCounters,
    pub config: SinkConfig,
    pub sizer: Arc<dyn SizeOf<T>>,
    pub sink_name: String,
    dispatcher_id: u64,
    gate_warning: RateLimitedLog,
    last_latency: SyncMutex<Option<Duration>>,
}

impl<T: Send + Sync + Clone + 'static, Req> Dispatcher<T, Req> {
    pub fn new(
        sink_name: impl Into<String>,
        queue: Arc<TwoTierQueue<T>>,
        throttle: Arc<AdaptiveThrottle>,
        bookmark: Arc<BookmarkCoordinator>,
        failover: Arc<FailoverController>,
        primary_client: Arc<dyn BackendClient<T, Req>>,
        secondary_client: Option<Arc<dyn BackendClient<T, Req>>>,
        network_gate: Arc<dyn NetworkGate>,
        metrics_sink: Arc<dyn MetricsSink>,
        sizer: Arc<dyn SizeOf<T>>,
        config: SinkConfig,
    ) -> Self {
        let dispatcher_id = bookmark.register_dispatcher();
        Self {
            queue,
            throttle,
            bookmark,
            failover,
            primary_client,
            secondary_client,
            network_gate,
            metrics_sink,
            counters: MetricsCounters::default(),
            config,
            sizer,
            sink_name: sink_name.into(),
            dispatcher_id,
            gate_warning: RateLimitedLog::new(Duration::from_secs(300)),
            last_latency: SyncMutex::new(None),
        }
    }

    fn active_client(&self) -> &Arc<dyn BackendClient<T, Req>> {
        match self.failover.active_client() {
            ActiveClient::Primary => &self.primary_client,
            ActiveClient::Secondary => self.secondary_client.as_ref().unwrap_or(&self.primary_client),
        }
    }

    fn batch_caps(&self) -> BatchCaps {
        self.config.batch_caps()
    }

    /// Runs until `stop` is raised and draining completes (or the grace
    /// deadline expires).
    pub async fn run(self: Arc<Self>, stop: Arc<StopSignal>) {
        stop.set_state(DispatcherState::Running);
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let draining = stop.state() == DispatcherState::Draining;
            if draining && grace_deadline.is_none() {
                grace_deadline = Some(Instant::now() + stop.grace);
            }

            let caps = if draining {
                BatchCaps {
                    max_wait: Duration::ZERO,
                    ..self.batch_caps()
                }
            } else {
                self.batch_caps()
            };

            let batch = self.queue.pop_batch(&caps, stop.notify()).await;

            match batch {
                Some(batch) => self.process_batch(batch, &stop).await,
                None => {
                    if draining {
                        let (primary_len, secondary_len, _, _) = self.queue.sizes().await;
                        if primary_len == 0 && secondary_len == 0 {
                            break;
                        }
                        if let Some(deadline) = grace_deadline {
                            if Instant::now() >= deadline {
                                tracing::warn!(
                                    sink = %self.sink_name,
                                    "grace deadline exceeded while draining, remaining queue contents dropped"
                                );
                                break;
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }

            self.emit_metrics().await;
        }

        stop.set_state(DispatcherState::Stopped);
    }

    /// Consumes batches from this worker's bounded sub-queue instead of
    /// popping directly from the shared two-tier queue. Several of these
    /// run concurrently, each fed by [`run_distributor`], to implement the
    /// parallel-dispatcher architecture of §4.3: within one sub-queue,
    /// submission order (and requeue-to-head order) is preserved; across
    /// sub-queues it is not. Exits once the distributor has stopped feeding
    /// it and the sub-queue has fully drained — the distributor owns all
    /// state transitions and drain/grace-deadline handling.
    pub async fn run_from_channel(
        self: Arc<Self>,
        stop: Arc<StopSignal>,
        mut batches: mpsc::UnboundedReceiver<SubQueueItem<T>>,
    ) {
        while let Some((batch, permit)) = batches.recv().await {
            drop(permit);
            self.process_batch(batch, &stop).await;
            self.emit_metrics().await;
        }
    }

    async fn emit_metrics(&self) {
        let (primary_len, secondary_len, _, _) = self.queue.sizes().await;
        let last_latency = *self.last_latency.lock();
        let snapshot = self.counters.snapshot(primary_len, secondary_len, last_latency);
        self.metrics_sink.publish(&self.sink_name, snapshot);
    }

    /// Runs one full attempt cycle for a popped batch: throttle wait,
    /// network gate, submit, interpret, and the requeue/drop/bookmark
    /// resolution from §4.3 step 5.
    async fn process_batch(&self, mut batch: Batch<T>, stop: &StopSignal) {
        if self.config.combine_records {
            let client = self.active_client().clone();
            if let Some(max_bytes) = client.combine_records() {
                batch = client.combine(batch, max_bytes);
            }
        }

        let amounts = [1.0, batch.len() as f64, batch.total_bytes as f64];
        let delay = self.throttle.delay_for(&amounts);
        if delay > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.notify().notified() => {}
            }
        }

        crate::network_gate::wait_until_allowed(
            self.network_gate.as_ref(),
            self.config.upload_network_priority,
            Duration::from_secs(10),
            Duration::from_secs(300),
            stop.notify(),
        )
        .await;

        self.failover.maybe_failover(&self.throttle);
        self.counters.record_attempt();

        let mut free_token_retries = 0u32;
        loop {
            let client = self.active_client().clone();
            let request = client.build_request(&batch);
            let started = Instant::now();
            let outcome = client.submit(request).await;
            *self.last_latency.lock() = Some(started.elapsed());

            match outcome {
                SubmitOutcome::Ok => {
                    self.throttle.set_success();
                    let count = batch.len() as u64;
                    self.counters.record_success(count);
                    self.bookmark.on_batch_acked(self.dispatcher_id, &batch.envelopes);
                    return;
                }
                SubmitOutcome::PartialFailure { per_entry } => {
                    self.throttle.set_error();
                    let failed_indices: Vec<usize> = per_entry.iter().map(|e| e.index).collect();
                    let (ok, failed) = batch.split_by_indices(&failed_indices);

                    // Open question #2: envelopes with no error advance
                    // their bookmark immediately, even though the failed
                    // subset is about to be requeued.
                    if !ok.is_empty() {
                        self.counters.record_success(ok.len() as u64);
                        self.bookmark.on_batch_acked(self.dispatcher_id, &ok.envelopes);
                    }

                    self.requeue_or_drop(failed, stop).await;
                    return;
                }
                SubmitOutcome::RecoverableError { kind } => {
                    if kind.is_free_retry() && free_token_retries < MAX_FREE_TOKEN_RETRIES {
                        free_token_retries += 1;
                        tracing::debug!(sink = %self.sink_name, attempt = free_token_retries, "retrying with refreshed token");
                        continue;
                    }
                    self.throttle.set_error();

                    if !client.is_recoverable(&kind) {
                        tracing::error!(sink = %self.sink_name, error = %kind, "backend classified error as non-recoverable, dropping batch");
                        self.counters.record_failed_nonrecoverable(batch.len() as u64);
                        return;
                    }

                    let hint = client.retry_hint(&kind);
                    if let Some(wait) = hint.retry_after {
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {}
                            _ = stop.notify().notified() => {}
                        }
                    }

                    self.requeue_or_drop(batch, stop).await;
                    return;
                }
                SubmitOutcome::NonRecoverableError { kind } => {
                    self.throttle.set_error();
                    tracing::error!(sink = %self.sink_name, error = %kind, "non-recoverable batch failure");
                    self.counters.record_failed_nonrecoverable(batch.len() as u64);
                    return;
                }
            }
        }
    }

    async fn requeue_or_drop(&self, batch: Batch<T>, stop: &StopSignal) {
        if batch.is_empty() {
            return;
        }
        let mut batch = batch;
        batch.attempts += 1;
        self.counters.record_failed_recoverable(batch.len() as u64);
        let exhausted = batch.attempts >= self.config.max_attempts;
        let has_secondary = self.secondary_available();

        // A batch that has used up MaxAttempts and has nowhere durable to go
        // is dropped outright rather than handed back to requeue_head, which
        // would happily readmit it to primary forever.
        if exhausted && !has_secondary {
            let count = batch.len() as u64;
            tracing::warn!(sink = %self.sink_name, attempts = batch.attempts, "max attempts exhausted, dropping batch");
            self.counters.record_failed_nonrecoverable(count);
            return;
        }

        let _ = stop; // cancellation during requeue is a no-op: requeue is not cancellable mid-write
        // Exhausted batches are allowed to overflow to the durable secondary,
        // deliberately breaking strict ordering in exchange for not losing
        // data that's already been retried MaxAttempts times in primary.
        let allow_overflow = exhausted;
        match self.queue.requeue_head(batch, allow_overflow).await {
            Ok(crate::queue::RequeueOutcome::Accepted) => {
                if exhausted {
                    tracing::warn!(sink = %self.sink_name, "max attempts exhausted, batch moved to overflow");
                } else {
                    crate::warn_rate_limited!(
                        self.gate_warning,
                        sink = %self.sink_name,
                        "recoverable error, requeuing batch"
                    );
                }
            }
            Ok(crate::queue::RequeueOutcome::Dropped) => {
                tracing::warn!(sink = %self.sink_name, "requeue had no room, batch dropped");
            }
            Err(err) => {
                tracing::warn!(sink = %self.sink_name, error = %err, "failed to persist overflowed batch");
            }
        }
    }

    fn secondary_available(&self) -> bool {
        // Mirrors queue.sizes()'s secondary presence without requiring an
        // async call here; a dispatcher only sets this up once, at
        // construction, via `config.secondary_queue_type`.
        !matches!(
            self.config.secondary_queue_type,
            crate::config::SecondaryQueueType::Unset
        )
    }
}

/// Feeds `channels` from the shared two-tier queue, implementing the
/// parallel-dispatcher fan-out of §4.3: "try each channel in turn, then
/// wait on the first" that frees up. This is the sole owner of
/// `DispatcherState` transitions and the drain grace deadline — workers
/// themselves ([`Dispatcher::run_from_channel`]) only drain their own
/// sub-queue, so keeping this logic in one place avoids races between
/// concurrently-running workers racing to flip the shared state.
///
/// Each channel is paired with an `Arc<Semaphore>` standing in for its
/// bound: a permit is acquired here before a batch is sent, and dropped by
/// the worker once received, freeing the slot. Semaphore permits are used
/// instead of `mpsc::Sender::reserve()` because `acquire_owned()` returns a
/// fully owned, `'static` permit — needed to race N acquisitions at once
/// with `futures::future::select_all` without borrowing from a local.
pub(crate) async fn run_distributor<T: Send + Sync + Clone + 'static>(
    queue: Arc<TwoTierQueue<T>>,
    config: SinkConfig,
    stop: Arc<StopSignal>,
    channels: Vec<(mpsc::UnboundedSender<SubQueueItem<T>>, Arc<Semaphore>)>,
) {
    stop.set_state(DispatcherState::Running);
    let n = channels.len();
    let mut next = 0usize;
    let mut grace_deadline: Option<Instant> = None;

    loop {
        let draining = stop.state() == DispatcherState::Draining;
        if draining && grace_deadline.is_none() {
            grace_deadline = Some(Instant::now() + stop.grace);
        }

        let caps = if draining {
            BatchCaps {
                max_wait: Duration::ZERO,
                ..config.batch_caps()
            }
        } else {
            config.batch_caps()
        };

        let batch = queue.pop_batch(&caps, stop.notify()).await;
        let batch = match batch {
            Some(b) => b,
            None => {
                if draining {
                    let (primary_len, secondary_len, _, _) = queue.sizes().await;
                    if primary_len == 0 && secondary_len == 0 {
                        break;
                    }
                    if let Some(deadline) = grace_deadline {
                        if Instant::now() >= deadline {
                            tracing::warn!(
                                "grace deadline exceeded while draining, remaining queue contents dropped"
                            );
                            break;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                continue;
            }
        };

        let mut claimed: Option<(usize, OwnedSemaphorePermit)> = None;
        for i in 0..n {
            let idx = (next + i) % n;
            if let Ok(permit) = channels[idx].1.clone().try_acquire_owned() {
                claimed = Some((idx, permit));
                break;
            }
        }

        let (idx, permit) = match claimed {
            Some(v) => v,
            None => {
                let waiters: Vec<
                    Pin<Box<dyn Future<Output = (usize, Result<OwnedSemaphorePermit, tokio::sync::AcquireError>)> + Send>>,
                > = channels
                    .iter()
                    .enumerate()
                    .map(|(i, (_, sem))| {
                        let sem = sem.clone();
                        Box::pin(async move { (i, sem.acquire_owned().await) }) as Pin<Box<dyn Future<Output = _> + Send>>
                    })
                    .collect();
                let ((idx, acquired), _, _) = futures::future::select_all(waiters).await;
                match acquired {
                    Ok(permit) => (idx, permit),
                    Err(_) => {
                        let _ = queue.requeue_head(batch, true).await;
                        continue;
                    }
                }
            }
        };

        next = (idx + 1) % n;
        let _ = channels[idx].0.send((batch, permit));
    }

    stop.set_state(DispatcherState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeClient, FakeRequest, ScriptedResponse};
    use crate::throttle::ThrottleConfig;
    use bytes::Bytes;

    fn byte_sizer() -> Arc<dyn SizeOf<Bytes>> {
        Arc::new(|env: &Envelope<Bytes>| env.payload.len())
    }

    fn dispatcher_with_client(
        client: FakeClient,
        config: SinkConfig,
    ) -> Arc<Dispatcher<Bytes, FakeRequest>> {
        let queue = Arc::new(TwoTierQueue::new(config.queue_size_items));
        let throttle = Arc::new(AdaptiveThrottle::new(
            vec![(1000.0, 1000.0), (1000.0, 1000.0), (1_000_000.0, 1_000_000.0)],
            ThrottleConfig::default(),
        ));
        let bookmark = BookmarkCoordinator::in_memory();
        let failover = FailoverController::new(false, config.failover_error_threshold, Duration::from_secs(60));
        Arc::new(Dispatcher::new(
            "test-sink",
            queue,
            throttle,
            bookmark,
            failover,
            Arc::new(client),
            None,
            Arc::new(crate::network_gate::AlwaysAllow),
            Arc::new(crate::metrics::NoopMetricsSink),
            byte_sizer(),
            config,
        ))
    }

    #[tokio::test]
    async fn happy_path_batches_and_commits_bookmark() {
        let client = FakeClient::new(vec![ScriptedResponse::AllOk; 10]);
        let mut config = SinkConfig::default();
        config.max_batch_size = 3;
        config.buffer_interval_ms = 50;
        let dispatcher = dispatcher_with_client(client, config);

        for i in 1..=5u64 {
            dispatcher
                .queue
                .push(
                    Envelope::new(Bytes::from_static(b"x"), i).with_bookmark_key("k1"),
                    dispatcher.sizer.as_ref(),
                    &dispatcher.batch_caps(),
                )
                .await
                .unwrap();
        }

        let stop = StopSignal::new(Duration::from_secs(1));
        let d2 = dispatcher.clone();
        let stop2 = stop.clone();
        let handle = tokio::spawn(async move { d2.run(stop2).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        stop.request_drain();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(dispatcher.bookmark.committed("k1"), Some(5));
    }

    #[tokio::test]
    async fn exhausted_retries_drop_batch_without_secondary() {
        let client = FakeClient::new(vec![
            ScriptedResponse::Recoverable,
            ScriptedResponse::Recoverable,
            ScriptedResponse::Recoverable,
        ]);
        let mut config = SinkConfig::default();
        config.max_attempts = 3;
        config.max_batch_size = 4;
        config.buffer_interval_ms = 20;
        let dispatcher = dispatcher_with_client(client, config);

        for i in 1..=4u64 {
            dispatcher
                .queue
                .push(Envelope::new(Bytes::from_static(b"x"), i), dispatcher.sizer.as_ref(), &dispatcher.batch_caps())
                .await
                .unwrap();
        }

        let stop = StopSignal::new(Duration::from_secs(2));
        for _ in 0..3 {
            let caps = dispatcher.batch_caps();
            if let Some(batch) = dispatcher.queue.pop_batch(&caps, stop.notify()).await {
                dispatcher.process_batch(batch, &stop).await;
            }
        }

        let (primary_len, secondary_len, _, _) = dispatcher.queue.sizes().await;
        assert_eq!(primary_len, 0);
        assert_eq!(secondary_len, 0);
    }
}
