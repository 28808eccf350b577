//! Per-key accumulation queue.
//!
//! Each compatibility key owns one `KeyQueue`, guarded by its own short
//! non-async lock. A queue holds at most one open job; closed jobs are moved
//! out to dispatch, and the queue only counts them until they finish.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use llmfold_core::{BatchItem, BatchJob, BatchState, CoreError, RequestId};
use serde::Serialize;
use tokio::task::JoinHandle;

use super::pending::Completer;

/// Lifecycle of a key's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyQueueState {
    /// Nothing open, nothing in flight
    Idle,
    /// A job is open and collecting requests
    Accumulating,
    /// No open job, but earlier jobs are still being dispatched
    Dispatching,
}

/// The open job and everything needed to answer its callers
#[derive(Debug)]
pub(crate) struct OpenJob {
    pub job: BatchJob,
    pub completers: Vec<Completer>,
    pub timer: Option<JoinHandle<()>>,
}

/// A job moved out of its queue, ready for dispatch
#[derive(Debug)]
pub(crate) struct ClosedJob {
    pub job: BatchJob,
    pub completers: HashMap<RequestId, Completer>,
}

#[derive(Debug, Default)]
pub struct KeyQueue {
    open: Option<OpenJob>,
    in_flight: usize,
}

impl KeyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> KeyQueueState {
        match (&self.open, self.in_flight) {
            (Some(_), _) => KeyQueueState::Accumulating,
            (None, 0) => KeyQueueState::Idle,
            (None, _) => KeyQueueState::Dispatching,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state() == KeyQueueState::Idle
    }

    /// Jobs that left this queue and have not finished yet
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn open_job(&self) -> Option<&BatchJob> {
        self.open.as_ref().map(|open| &open.job)
    }

    pub(crate) fn open_job_id(&self) -> Option<u64> {
        self.open_job().map(BatchJob::id)
    }

    /// Start accumulating into `job`; a previously open job is returned closed
    pub(crate) fn open(&mut self, job: BatchJob) -> Option<ClosedJob> {
        let previous = self.close();
        self.open = Some(OpenJob { job, completers: Vec::new(), timer: None });
        previous
    }

    pub(crate) fn set_timer(&mut self, timer: JoinHandle<()>) {
        match self.open.as_mut() {
            Some(open) => open.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Add an item to the open job
    ///
    /// On failure the caller is answered with the error right away.
    pub(crate) fn push(&mut self, item: BatchItem, completer: Completer) -> Result<(), CoreError> {
        let Some(open) = self.open.as_mut() else {
            let err = CoreError::NotOpen(BatchState::Closed);
            completer.fulfill(Err(err.clone().into()));
            return Err(err);
        };

        match open.job.push(item) {
            Ok(()) => {
                open.completers.push(completer);
                Ok(())
            }
            Err(err) => {
                completer.fulfill(Err(err.clone().into()));
                Err(err)
            }
        }
    }

    /// Close the open job, if any, and count it as in flight
    ///
    /// The window timer is cancelled; a timer that is itself closing the job
    /// has nothing left to await, so cancelling it is harmless.
    pub(crate) fn close(&mut self) -> Option<ClosedJob> {
        let OpenJob { mut job, completers, timer } = self.open.take()?;
        if let Some(timer) = timer {
            timer.abort();
        }

        advance(&mut job, BatchState::Closed);
        self.in_flight += 1;

        let completers = completers.into_iter().map(|c| (c.id(), c)).collect();
        Some(ClosedJob { job, completers })
    }

    /// Count a job that skipped accumulation entirely
    pub(crate) fn close_alone(&mut self, mut job: BatchJob, completer: Completer) -> ClosedJob {
        advance(&mut job, BatchState::Closed);
        self.in_flight += 1;
        let completers = HashMap::from([(completer.id(), completer)]);
        ClosedJob { job, completers }
    }

    /// A dispatched job has answered all of its callers
    pub(crate) fn finish(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// Lock a queue, recovering the data if a previous holder panicked
pub(crate) fn lock(queue: &Mutex<KeyQueue>) -> MutexGuard<'_, KeyQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply a job transition the scheduler knows to be legal
pub(crate) fn advance(job: &mut BatchJob, next: BatchState) {
    if let Err(err) = job.transition(next) {
        tracing::error!(batch_id = job.id(), error = %err, "Unexpected batch transition");
    }
}
