//! One-shot completion handles.
//!
//! Admission hands the caller a [`PendingResult`] and keeps the matching
//! [`Completer`]. The scheduler is the only writer, and a completer is
//! consumed when it fires, so every request is fulfilled at most once.

use llmfold_core::{ChatResponse, RequestId};
use tokio::sync::oneshot;

use crate::error::SchedulerError;

type Outcome = Result<ChatResponse, SchedulerError>;

/// Create a connected completer/result pair for `id`
pub fn channel(id: RequestId) -> (Completer, PendingResult) {
    let (tx, rx) = oneshot::channel();
    (Completer { id, tx }, PendingResult { id, rx })
}

/// Caller side: resolves once the scheduler fulfills the request
#[derive(Debug)]
pub struct PendingResult {
    id: RequestId,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingResult {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the outcome
    ///
    /// A completer dropped without firing yields [`SchedulerError::Dropped`].
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Err(SchedulerError::Dropped))
    }
}

/// Scheduler side of a pending request
#[derive(Debug)]
pub struct Completer {
    id: RequestId,
    tx: oneshot::Sender<Outcome>,
}

impl Completer {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Deliver the outcome; `false` when the caller stopped waiting
    pub fn fulfill(self, outcome: Outcome) -> bool {
        let delivered = self.tx.send(outcome).is_ok();
        if !delivered {
            tracing::debug!(request_id = %self.id, "Caller went away before its result was ready");
        }
        delivered
    }
}
