//! Two-tier buffered queue (C2): bounded in-memory batch queue with
//! optional overflow to a durable on-disk queue.

use crate::durable_queue::{BatchCodec, DurableQueue};
use crate::envelope::{Batch, Envelope, SizeOf};
use crate::error::QueueError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Outcome of [`TwoTierQueue::push`]. `Blocked` hands the envelope back so
/// a backpressure strategy can decide whether to retry, sleep, or drop it.
pub enum PushOutcome<T> {
    Ready,
    Blocked(Envelope<T>),
    Rejected,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RequeueOutcome {
    Accepted,
    Dropped,
}

/// A backpressure strategy for [`TwoTierQueue::push_with_backpressure`],
/// mirroring the Sleep/Yield/Drop/Block strategies used elsewhere in the
/// corpus for bounded in-memory buffers.
#[derive(Debug, Clone, Copy)]
pub enum BackpressureStrategy {
    Sleep(Duration),
    Yield,
    Drop,
    Block,
}

const MAX_BACKPRESSURE_ATTEMPTS: u32 = 100;

enum QueueItem<T> {
    Raw(Envelope<T>, usize),
    Requeued(Batch<T>),
}

struct Primary<T> {
    items: VecDeque<QueueItem<T>>,
    record_count: usize,
    cap_items: usize,
}

enum Secondary<T> {
    Memory {
        items: VecDeque<Batch<T>>,
        cap_batches: usize,
    },
    Durable(DurableQueue<Batch<T>>),
}

impl<T> Secondary<T> {
    fn len(&self) -> usize {
        match self {
            Secondary::Memory { items, .. } => items.len(),
            Secondary::Durable(q) => q.len(),
        }
    }

    fn is_full(&self) -> bool {
        match self {
            Secondary::Memory { items, cap_batches } => items.len() >= *cap_batches,
            Secondary::Durable(q) => q.is_full(),
        }
    }

    /// Returns `true` if pushing this batch evicted an older one.
    async fn push(&mut self, batch: Batch<T>) -> Result<bool, QueueError> {
        match self {
            Secondary::Memory { items, cap_batches } => {
                let evicted = items.len() >= *cap_batches;
                if evicted {
                    items.pop_front();
                }
                items.push_back(batch);
                Ok(evicted)
            }
            Secondary::Durable(q) => q.push(&batch).await,
        }
    }

    async fn pop_front(&mut self) -> Result<Option<Batch<T>>, QueueError> {
        match self {
            Secondary::Memory { items, .. } => Ok(items.pop_front()),
            Secondary::Durable(q) => q.pop_front().await,
        }
    }
}

/// Caps a single call to `popBatch` assembles under.
#[derive(Debug, Clone, Copy)]
pub struct BatchCaps {
    pub max_count: usize,
    pub max_bytes: usize,
    pub max_wait: Duration,
}

/// Bounded in-memory batch queue with optional overflow to a durable
/// on-disk queue. A batch is in exactly one tier at any time; requeue
/// always targets head-of-primary.
pub struct TwoTierQueue<T> {
    primary: Mutex<Primary<T>>,
    secondary: Option<tokio::sync::Mutex<Secondary<T>>>,
    notify: Notify,
    evictions: std::sync::atomic::AtomicU64,
}

impl<T: Send + 'static> TwoTierQueue<T> {
    pub fn new(primary_cap_items: usize) -> Self {
        Self {
            primary: Mutex::new(Primary {
                items: VecDeque::new(),
                record_count: 0,
                cap_items: primary_cap_items,
            }),
            secondary: None,
            notify: Notify::new(),
            evictions: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn with_memory_secondary(mut self, cap_batches: usize) -> Self {
        self.secondary = Some(tokio::sync::Mutex::new(Secondary::Memory {
            items: VecDeque::new(),
            cap_batches,
        }));
        self
    }

    pub async fn with_durable_secondary(
        mut self,
        dir: impl Into<std::path::PathBuf>,
        cap_batches: usize,
        codec: Box<dyn BatchCodec<Batch<T>>>,
    ) -> Result<Self, QueueError> {
        let queue = DurableQueue::open(dir, cap_batches, codec).await?;
        self.secondary = Some(tokio::sync::Mutex::new(Secondary::Durable(queue)));
        Ok(self)
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Pushes one envelope. A single record whose size exceeds `max_bytes`
    /// is rejected non-recoverably and never enqueued (callers should
    /// increment their own drop counter on `Err`).
    pub async fn push(
        &self,
        envelope: Envelope<T>,
        sizer: &dyn SizeOf<T>,
        caps: &BatchCaps,
    ) -> Result<PushOutcome<T>, QueueError> {
        let size = sizer.size_of(&envelope);
        if size > caps.max_bytes {
            return Err(QueueError::RecordTooLarge {
                size,
                max: caps.max_bytes,
            });
        }

        let envelope = {
            let mut primary = self.primary.lock();
            if primary.record_count < primary.cap_items {
                primary.items.push_back(QueueItem::Raw(envelope, size));
                primary.record_count += 1;
                None
            } else {
                Some(envelope)
            }
        };

        let Some(envelope) = envelope else {
            self.notify.notify_one();
            return Ok(PushOutcome::Ready);
        };

        // Primary full: overflow a singleton batch to secondary if present.
        let Some(secondary) = &self.secondary else {
            return Ok(PushOutcome::Blocked(envelope));
        };
        let mut batch = Batch::new();
        batch.push(envelope, size);

        let mut guard = secondary.lock().await;
        let evicted = guard.push(batch).await?;
        if evicted {
            self.evictions.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(PushOutcome::Ready)
    }

    /// Push with a bounded-retry backpressure strategy when primary is full
    /// and there's no secondary to absorb overflow.
    pub async fn push_with_backpressure(
        &self,
        mut envelope: Envelope<T>,
        sizer: &dyn SizeOf<T>,
        caps: &BatchCaps,
        strategy: BackpressureStrategy,
    ) -> Result<PushOutcome<T>, QueueError> {
        for attempt in 0..MAX_BACKPRESSURE_ATTEMPTS {
            match self.push(envelope, sizer, caps).await? {
                PushOutcome::Ready => return Ok(PushOutcome::Ready),
                PushOutcome::Rejected => return Ok(PushOutcome::Rejected),
                PushOutcome::Blocked(returned) => match strategy {
                    BackpressureStrategy::Drop => return Ok(PushOutcome::Rejected),
                    BackpressureStrategy::Yield => {
                        envelope = returned;
                        tokio::task::yield_now().await;
                    }
                    BackpressureStrategy::Sleep(d) => {
                        envelope = returned;
                        tokio::time::sleep(d).await;
                    }
                    BackpressureStrategy::Block => {
                        if attempt + 1 == MAX_BACKPRESSURE_ATTEMPTS {
                            return Ok(PushOutcome::Blocked(returned));
                        }
                        envelope = returned;
                        tokio::task::yield_now().await;
                    }
                },
            };
        }
        Ok(PushOutcome::Blocked(envelope))
    }

    /// Returns as soon as: (a) `max_wait` elapsed and at least one envelope
    /// is present; (b) adding the next envelope would exceed the caps; or
    /// (c) a drain signal fires. Drains primary first; only pulls from
    /// secondary when primary is empty.
    pub async fn pop_batch(&self, caps: &BatchCaps, drain: &Notify) -> Option<Batch<T>> {
        let deadline = Instant::now() + caps.max_wait;

        loop {
            if let Some(batch) = self.try_assemble_from_primary(caps) {
                return Some(batch);
            }

            if let Some(secondary) = &self.secondary {
                let primary_empty = self.primary.lock().items.is_empty();
                if primary_empty {
                    let mut guard = secondary.lock().await;
                    if let Ok(Some(batch)) = guard.pop_front().await {
                        return Some(batch);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let remaining = deadline - now;

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = drain.notified() => return None,
                _ = tokio::time::sleep(remaining) => {
                    // one more pass to flush whatever partial content exists
                    return self.try_assemble_from_primary(caps);
                }
            }
        }
    }

    fn try_assemble_from_primary(&self, caps: &BatchCaps) -> Option<Batch<T>> {
        let mut primary = self.primary.lock();

        if let Some(QueueItem::Requeued(_)) = primary.items.front() {
            if let Some(QueueItem::Requeued(batch)) = primary.items.pop_front() {
                primary.record_count -= batch.len();
                return Some(batch);
            }
        }

        if primary.items.is_empty() {
            return None;
        }

        let mut batch = Batch::new();
        let mut taken = 0usize;
        while let Some(QueueItem::Raw(_, size)) = primary.items.front() {
            let size = *size;
            if batch.len() + 1 > caps.max_count || batch.total_bytes + size > caps.max_bytes {
                break;
            }
            if let Some(QueueItem::Raw(env, size)) = primary.items.pop_front() {
                batch.push(env, size);
                taken += 1;
            }
        }
        primary.record_count -= taken;

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// Requeues a batch at the head of primary. If there's no room and
    /// `allow_overflow` is set, pushes to secondary instead (deliberately
    /// breaking source ordering to avoid blocking newer work). Returns
    /// `Dropped` if neither is possible.
    pub async fn requeue_head(
        &self,
        batch: Batch<T>,
        allow_overflow: bool,
    ) -> Result<RequeueOutcome, QueueError> {
        let batch = {
            let mut primary = self.primary.lock();
            if primary.record_count + batch.len() <= primary.cap_items {
                primary.record_count += batch.len();
                primary.items.push_front(QueueItem::Requeued(batch));
                None
            } else {
                Some(batch)
            }
        };
        let Some(batch) = batch else {
            self.notify.notify_one();
            return Ok(RequeueOutcome::Accepted);
        };

        if allow_overflow {
            if let Some(secondary) = &self.secondary {
                let mut guard = secondary.lock().await;
                let evicted = guard.push(batch).await?;
                if evicted {
                    self.evictions
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                return Ok(RequeueOutcome::Accepted);
            }
        }
        Ok(RequeueOutcome::Dropped)
    }

    /// `(primaryCount, secondaryCount, primaryFull, secondaryFull)`.
    pub async fn sizes(&self) -> (usize, usize, bool, bool) {
        let (primary_count, primary_full) = {
            let primary = self.primary.lock();
            (primary.record_count, primary.record_count >= primary.cap_items)
        };
        let (secondary_count, secondary_full) = match &self.secondary {
            Some(secondary) => {
                let guard = secondary.lock().await;
                (guard.len(), guard.is_full())
            }
            None => (0, false),
        };
        (primary_count, secondary_count, primary_full, secondary_full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> BatchCaps {
        BatchCaps {
            max_count: 3,
            max_bytes: 1_000_000,
            max_wait: Duration::from_millis(50),
        }
    }

    fn byte_sizer() -> impl SizeOf<u64> {
        |_: &Envelope<u64>| 10usize
    }

    #[tokio::test]
    async fn pop_batch_respects_max_count() {
        let queue = TwoTierQueue::new(100);
        let sizer = byte_sizer();
        for i in 0..5u64 {
            queue.push(Envelope::new(i, i), &sizer, &caps()).await.unwrap();
        }
        let drain = Notify::new();
        let batch = queue.pop_batch(&caps(), &drain).await.unwrap();
        assert_eq!(batch.len(), 3);
        let batch2 = queue.pop_batch(&caps(), &drain).await.unwrap();
        assert_eq!(batch2.len(), 2);
    }

    #[tokio::test]
    async fn single_oversized_record_is_rejected_never_enqueued() {
        let queue: TwoTierQueue<u64> = TwoTierQueue::new(100);
        let sizer = |_: &Envelope<u64>| 2_000_000usize;
        let caps = BatchCaps {
            max_count: 10,
            max_bytes: 1_000_000,
            max_wait: Duration::from_millis(10),
        };
        let result = queue.push(Envelope::new(1, 1), &sizer, &caps).await;
        assert!(matches!(result, Err(QueueError::RecordTooLarge { .. })));
        let (primary_count, _, _, _) = queue.sizes().await;
        assert_eq!(primary_count, 0);
    }

    #[tokio::test]
    async fn requeue_head_is_returned_before_newer_work() {
        let queue = TwoTierQueue::new(100);
        let sizer = byte_sizer();
        queue.push(Envelope::new(1u64, 1), &sizer, &caps()).await.unwrap();

        let mut failed = Batch::new();
        failed.push(Envelope::new(99u64, 99), 10);
        queue.requeue_head(failed, false).await.unwrap();

        let drain = Notify::new();
        let batch = queue.pop_batch(&caps(), &drain).await.unwrap();
        assert_eq!(batch.envelopes[0].position, 99);
    }

    #[tokio::test]
    async fn overflow_to_secondary_when_primary_full() {
        let queue = TwoTierQueue::new(1).with_memory_secondary(10);
        let sizer = byte_sizer();
        queue.push(Envelope::new(1u64, 1), &sizer, &caps()).await.unwrap();
        let outcome = queue.push(Envelope::new(2u64, 2), &sizer, &caps()).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Ready));
        let (_, secondary_count, _, _) = queue.sizes().await;
        assert_eq!(secondary_count, 1);
    }

    #[tokio::test]
    async fn no_batch_is_in_both_tiers_simultaneously() {
        let queue = TwoTierQueue::new(1).with_memory_secondary(1);
        let sizer = byte_sizer();
        queue.push(Envelope::new(1u64, 1), &sizer, &caps()).await.unwrap();
        queue.push(Envelope::new(2u64, 2), &sizer, &caps()).await.unwrap();
        let (primary_count, secondary_count, _, _) = queue.sizes().await;
        assert_eq!(primary_count + secondary_count, 2);
    }
}
