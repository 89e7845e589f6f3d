//! A scriptable fake [`BackendClient`], used by this crate's own unit tests
//! and by `tests/end_to_end.rs`. Not part of the public API.

use crate::backend::{BackendClient, EntryError, SubmitOutcome};
use crate::envelope::{Batch, Envelope};
use crate::error::DispatchError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// One scripted reply for a `FakeClient::submit` call.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    AllOk,
    PartialFailure(Vec<usize>),
    Recoverable,
    InvalidToken,
    NonRecoverable,
}

#[derive(Debug)]
pub struct FakeRequest {
    pub batch: Batch<Bytes>,
}

/// Replays a fixed script of responses in order, one per `submit` call; the
/// last entry repeats once the script is exhausted. Records every batch it
/// was asked to build a request for, so tests can assert on what the
/// dispatcher actually sent.
pub struct FakeClient {
    script: Mutex<Vec<ScriptedResponse>>,
    cursor: Mutex<usize>,
    pub submitted: Arc<Mutex<Vec<Batch<Bytes>>>>,
}

impl FakeClient {
    pub fn new(script: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(script),
            cursor: Mutex::new(0),
            submitted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn next_response(&self) -> ScriptedResponse {
        let script = self.script.lock();
        let mut cursor = self.cursor.lock();
        let idx = (*cursor).min(script.len().saturating_sub(1));
        *cursor += 1;
        script
            .get(idx)
            .cloned()
            .unwrap_or(ScriptedResponse::AllOk)
    }
}

#[async_trait]
impl BackendClient<Bytes, FakeRequest> for FakeClient {
    fn size_of(&self, envelope: &Envelope<Bytes>) -> usize {
        envelope.payload.len()
    }

    fn build_request(&self, batch: &Batch<Bytes>) -> FakeRequest {
        self.submitted.lock().push(batch.clone());
        FakeRequest {
            batch: batch.clone(),
        }
    }

    async fn submit(&self, request: FakeRequest) -> SubmitOutcome {
        let _ = request;
        match self.next_response() {
            ScriptedResponse::AllOk => SubmitOutcome::Ok,
            ScriptedResponse::PartialFailure(indices) => SubmitOutcome::PartialFailure {
                per_entry: indices
                    .into_iter()
                    .map(|index| EntryError {
                        index,
                        error_code: "ProvisionedThroughputExceeded".into(),
                        error_message: "per-entry throttled".into(),
                    })
                    .collect(),
            },
            ScriptedResponse::Recoverable => SubmitOutcome::RecoverableError {
                kind: DispatchError::RecoverableTransport("connection reset".into()),
            },
            ScriptedResponse::InvalidToken => SubmitOutcome::RecoverableError {
                kind: DispatchError::RecoverableInvalidToken,
            },
            ScriptedResponse::NonRecoverable => SubmitOutcome::NonRecoverableError {
                kind: DispatchError::NonRecoverableMalformed("bad record".into()),
            },
        }
    }
}
