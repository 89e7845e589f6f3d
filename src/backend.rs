//! Backend capability-set trait (§9): replaces dynamic dispatch over a
//! class hierarchy of sinks with a small interface each concrete backend
//! implements. The dispatcher is polymorphic only over this trait.

use crate::envelope::Batch;
use crate::error::{DispatchError, RetryHint};
use async_trait::async_trait;

/// Index of a record within a submitted batch, used by [`SubmitOutcome`] to
/// report per-entry errors.
pub type RecordIndex = usize;

/// One per-entry error from a partial-failure response.
#[derive(Debug, Clone)]
pub struct EntryError {
    pub index: RecordIndex,
    pub error_code: String,
    pub error_message: String,
}

/// Explicit result variants returned from a backend adapter, replacing the
/// thrown-exception control flow the source used to signal partial
/// success. The dispatcher switches on the variant.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Ok,
    PartialFailure { per_entry: Vec<EntryError> },
    RecoverableError { kind: DispatchError },
    NonRecoverableError { kind: DispatchError },
}

/// The capability set a concrete backend implements. `T` is the record
/// payload type; `Req` is whatever shape `build_request` produces (a
/// provider-specific wire request).
#[async_trait]
pub trait BackendClient<T, Req>: Send + Sync {
    /// Per-record size, including any provider-side overhead. A size
    /// greater than the configured per-record limit signals the record
    /// should be dropped as non-recoverable rather than batched.
    fn size_of(&self, envelope: &crate::envelope::Envelope<T>) -> usize;

    /// Build the provider-shaped request for one batch.
    fn build_request(&self, batch: &Batch<T>) -> Req;

    /// Submit a request and interpret the provider's response.
    async fn submit(&self, request: Req) -> SubmitOutcome;

    /// Whether a given error kind is transient for this backend (some
    /// providers classify errors the generic taxonomy can't predict). The
    /// dispatcher consults this before requeuing a `RecoverableError`;
    /// returning `false` downgrades it to a non-recoverable drop instead.
    fn is_recoverable(&self, err: &DispatchError) -> bool {
        err.is_recoverable()
    }

    /// Retry-after hint for a given error, mirroring the `retry_after` a
    /// provider's throttling response carries. The dispatcher sleeps for
    /// this long (cancellably) before requeuing. Default is no extra delay
    /// beyond the throttle's own backoff.
    fn retry_hint(&self, _err: &DispatchError) -> RetryHint {
        RetryHint::default()
    }

    /// Optional small-record coalescing; returning `None` disables the
    /// `CombineRecords` opt-in for this backend. `Some(max_bytes)` is the
    /// largest size one coalesced record may reach.
    fn combine_records(&self) -> Option<usize> {
        None
    }

    /// Coalesce `batch` into `max_bytes`-sized buckets ahead of
    /// `build_request`, called only when `combine_records` opted in. The
    /// default is a no-op; backends whose payload type supports
    /// concatenation (e.g. `Bytes`) override it.
    fn combine(&self, batch: Batch<T>, max_bytes: usize) -> Batch<T> {
        let _ = max_bytes;
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_error_carries_index_for_split() {
        let err = EntryError {
            index: 2,
            error_code: "Throttled".into(),
            error_message: "rate exceeded".into(),
        };
        assert_eq!(err.index, 2);
    }
}
