//! Record envelope and batch types (C1).

use bytes::Bytes;
use std::time::SystemTime;

/// One record plus the metadata needed to batch, bookmark and size it.
///
/// `position` is only meaningful relative to other envelopes carrying the
/// same `bookmark_key`: within one source, positions must be non-decreasing.
/// The pipeline never checks this itself (the source owns the invariant);
/// it only ever takes the max per key when committing.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub timestamp: SystemTime,
    pub bookmark_key: Option<String>,
    pub position: u64,
}

impl<T> Envelope<T> {
    pub fn new(payload: T, position: u64) -> Self {
        Self {
            payload,
            timestamp: SystemTime::now(),
            bookmark_key: None,
            position,
        }
    }

    pub fn with_bookmark_key(mut self, key: impl Into<String>) -> Self {
        self.bookmark_key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, ts: SystemTime) -> Self {
        self.timestamp = ts;
        self
    }
}

/// Per-record size function. Implementations must include any provider-side
/// overhead (e.g. a fixed per-record byte tax for log events). Returning a
/// size greater than `max_record_bytes` signals the record should be
/// dropped as non-recoverable rather than batched.
pub trait SizeOf<T>: Send + Sync {
    fn size_of(&self, envelope: &Envelope<T>) -> usize;
}

impl<T, F> SizeOf<T> for F
where
    F: Fn(&Envelope<T>) -> usize + Send + Sync,
{
    fn size_of(&self, envelope: &Envelope<T>) -> usize {
        self(envelope)
    }
}

/// An ordered group of envelopes assembled under simultaneous count/byte
/// caps. Ephemeral: it exists from the moment the queue yields it until the
/// dispatcher resolves it (ack / requeue / drop).
#[derive(Debug, Clone, Default)]
pub struct Batch<T> {
    pub envelopes: Vec<Envelope<T>>,
    /// Per-envelope size, same index as `envelopes`, so a split can carry
    /// exact byte totals into both halves instead of an average.
    entry_bytes: Vec<usize>,
    pub total_bytes: usize,
    /// Recoverable attempts already spent on this batch (as opposed to a
    /// fresh assembly from the queue). Used by the dispatcher to decide
    /// when `MaxAttempts` is exhausted; free retries (e.g. invalid sequence
    /// token) do not increment this.
    pub attempts: u32,
}

impl<T> Batch<T> {
    pub fn new() -> Self {
        Self {
            envelopes: Vec::new(),
            entry_bytes: Vec::new(),
            total_bytes: 0,
            attempts: 0,
        }
    }

    pub fn push(&mut self, envelope: Envelope<T>, size: usize) {
        self.envelopes.push(envelope);
        self.entry_bytes.push(size);
        self.total_bytes += size;
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Split this batch into (kept, removed) by index, used to carve out the
    /// failed subset of a partial-failure response.
    pub fn split_by_indices(mut self, failed_indices: &[usize]) -> (Batch<T>, Batch<T>) {
        let mut failed = Batch::new();
        let mut ok = Batch::new();
        let sizes = std::mem::take(&mut self.entry_bytes);
        for (i, (env, size)) in self.envelopes.drain(..).zip(sizes).enumerate() {
            if failed_indices.contains(&i) {
                failed.push(env, size);
            } else {
                ok.push(env, size);
            }
        }
        ok.attempts = self.attempts;
        failed.attempts = self.attempts;
        (ok, failed)
    }
}

/// A record's raw bytes, used by the reference byte-oriented backend
/// adapter. Domain-specific payloads implement their own `SizeOf`/request
/// builder instead of going through this type.
pub type RawRecord = Bytes;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_bookmark_and_position() {
        let env = Envelope::new("payload", 5).with_bookmark_key("k1");
        assert_eq!(env.position, 5);
        assert_eq!(env.bookmark_key.as_deref(), Some("k1"));
    }

    #[test]
    fn batch_tracks_total_bytes() {
        let mut batch = Batch::new();
        batch.push(Envelope::new(1, 1), 10);
        batch.push(Envelope::new(2, 2), 20);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.total_bytes, 30);
    }

    #[test]
    fn split_by_indices_separates_failed_subset() {
        let mut batch = Batch::new();
        for i in 0..4u64 {
            batch.push(Envelope::new(i, i), 1);
        }
        let (ok, failed) = batch.split_by_indices(&[1, 3]);
        assert_eq!(ok.len(), 2);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed.envelopes[0].position, 1);
        assert_eq!(failed.envelopes[1].position, 3);
    }

    #[test]
    fn split_by_indices_keeps_exact_byte_totals_for_uneven_sizes() {
        let mut batch = Batch::new();
        batch.push(Envelope::new(0u64, 0), 5);
        batch.push(Envelope::new(1u64, 1), 100);
        batch.push(Envelope::new(2u64, 2), 7);
        let (ok, failed) = batch.split_by_indices(&[1]);
        assert_eq!(ok.total_bytes, 12);
        assert_eq!(failed.total_bytes, 100);
    }
}
