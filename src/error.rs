//! Error types for the sink ingestion pipeline.

use std::time::Duration;
use thiserror::Error;

/// Errors from the two-tier queue (C2).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("record of {size} bytes exceeds max batch bytes {max}")]
    RecordTooLarge { size: usize, max: usize },

    #[error("primary queue is full and no secondary queue is configured")]
    Rejected,

    #[error("durable queue io error: {0}")]
    Durable(#[source] std::io::Error),

    #[error("durable queue record corrupt: {0}")]
    Corrupt(String),
}

/// Errors from the bookmark coordinator (C5).
#[derive(Debug, Error)]
pub enum BookmarkError {
    #[error("io error persisting bookmark for {source_key}: {source}")]
    Io {
        source_key: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "rejected non-monotonic commit for {source_key}: committed={committed} attempted={attempted}"
    )]
    NonMonotonic {
        source_key: String,
        committed: u64,
        attempted: u64,
    },
}

/// The exception taxonomy from the error handling design (recoverable
/// transport/protocol vs. non-recoverable input/fatal).
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("network error: {0}")]
    RecoverableTransport(String),

    #[error("provider unavailable or throughput exceeded: {0}")]
    RecoverableThrottled(String),

    #[error("request timed out")]
    RecoverableTimeout,

    #[error("invalid sequence token")]
    RecoverableInvalidToken,

    #[error("resource not found: {0}")]
    RecoverableResourceMissing(String),

    #[error("record exceeds provider per-record limit")]
    NonRecoverableRecordTooLarge,

    #[error("invalid parameter rejected by backend: {0}")]
    NonRecoverableInvalidParameter(String),

    #[error("batch time span exceeds provider limit")]
    NonRecoverableSpanExceeded,

    #[error("authentication or authorization denied: {0}")]
    NonRecoverableAuth(String),

    #[error("malformed request: {0}")]
    NonRecoverableMalformed(String),

    #[error("attempts exhausted")]
    NonRecoverableExhausted,
}

impl DispatchError {
    /// Whether this error kind is handled by requeue + throttle feedback,
    /// as opposed to an immediate drop.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DispatchError::RecoverableTransport(_)
                | DispatchError::RecoverableThrottled(_)
                | DispatchError::RecoverableTimeout
                | DispatchError::RecoverableInvalidToken
                | DispatchError::RecoverableResourceMissing(_)
        )
    }

    /// Invalid-sequence-token retries are independently capped and do not
    /// consume the batch's normal `MaxAttempts` budget.
    pub fn is_free_retry(&self) -> bool {
        matches!(self, DispatchError::RecoverableInvalidToken)
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DispatchError::RecoverableTimeout
        } else {
            DispatchError::RecoverableTransport(err.to_string())
        }
    }
}

/// Top-level error aggregating every subsystem error for callers that just
/// want one error type.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Bookmark(#[from] BookmarkError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("sink is already stopped")]
    Stopped,
}

/// Rate-limiting hint a [`crate::failover::FailoverController`] or backend
/// adapter can surface alongside a recoverable error, mirroring the
/// `retry_after` the teacher's `StreamError::RateLimited` carried.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryHint {
    pub retry_after: Option<Duration>,
}
