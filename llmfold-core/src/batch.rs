//! Batch jobs: bounded groups of compatible requests.

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::budget::BudgetedPrompt;
use crate::classifier::CompatibilityKey;
use crate::error::{CoreError, Result};
use crate::fingerprint::Fingerprint;
use crate::types::{ChatRequest, RequestId};

/// Lifecycle of a batch job
///
/// Transitions only move forward:
/// `Open -> Closed -> Dispatched -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    /// Accepting new items
    Open,
    /// Window elapsed or cap reached, no more items
    Closed,
    /// Combined downstream call issued
    Dispatched,
    /// Every item has its answer
    Completed,
    /// The combined call failed and items went to fallback
    Failed,
}

impl BatchState {
    fn can_become(self, next: BatchState) -> bool {
        matches!(
            (self, next),
            (BatchState::Open, BatchState::Closed)
                | (BatchState::Closed, BatchState::Dispatched)
                | (BatchState::Dispatched, BatchState::Completed)
                | (BatchState::Dispatched, BatchState::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Open => "open",
            BatchState::Closed => "closed",
            BatchState::Dispatched => "dispatched",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// One admitted request together with what admission computed for it
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub request: ChatRequest,
    pub budget: BudgetedPrompt,
    pub fingerprint: Fingerprint,
    /// Tokens reserved for this item's answer
    pub output_reserve: usize,
}

impl BatchItem {
    pub fn new(request: ChatRequest, budget: BudgetedPrompt, output_reserve: usize) -> Self {
        let fingerprint = Fingerprint::of(&request);
        Self { request, budget, fingerprint, output_reserve }
    }

    pub fn id(&self) -> RequestId {
        self.request.id
    }
}

/// A bounded group of requests sharing one compatibility key
#[derive(Debug)]
pub struct BatchJob {
    id: u64,
    key: CompatibilityKey,
    items: Vec<BatchItem>,
    capacity: usize,
    opened_at: Instant,
    state: BatchState,
}

impl BatchJob {
    /// Open an empty job holding at most `capacity` items (at least one)
    pub fn new(id: u64, key: CompatibilityKey, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            key,
            items: Vec::with_capacity(capacity),
            capacity,
            opened_at: Instant::now(),
            state: BatchState::Open,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CompatibilityKey {
        &self.key
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Items in arrival order
    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Request ids in arrival order
    pub fn ids(&self) -> Vec<RequestId> {
        self.items.iter().map(BatchItem::id).collect()
    }

    /// Append an item; the job must be open and below capacity
    pub fn push(&mut self, item: BatchItem) -> Result<()> {
        if self.state != BatchState::Open {
            return Err(CoreError::NotOpen(self.state));
        }
        if self.is_full() {
            return Err(CoreError::BatchFull { capacity: self.capacity });
        }
        self.items.push(item);
        Ok(())
    }

    /// Move to `next`, rejecting anything but a single forward step
    pub fn transition(&mut self, next: BatchState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(CoreError::transition(self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// Take the items out of a job that has reached a terminal state or is being
    /// handed to dispatch
    pub fn take_items(&mut self) -> Vec<BatchItem> {
        std::mem::take(&mut self.items)
    }
}
