//! Request batching for the llmfold proxy.
//!
//! Compatible requests (same model, sampling parameters and system prompt)
//! arriving within a short window are merged into one downstream call. The
//! combined answer is split back per request id; anything that cannot be
//! recovered from it is retried individually.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Incoming Requests                     │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │ ResponseCache   │ ← hit: answered immediately
//!                    └────────┬────────┘
//!                             │ miss
//!                    ┌────────▼────────┐
//!                    │ PromptBudgeter  │ ← fit to context_budget
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │   Key queues    │ ← one open job per key
//!                    │  ┌───────────┐  │   closes on window, size
//!                    │  │ m/t=0.2/… │  │   or token cap
//!                    │  │ m/t=0.7/… │  │
//!                    │  └───────────┘  │
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │   Dispatch      │ ← 1 item: plain call
//!                    │                 │   N items: merged call + parse
//!                    └────────┬────────┘
//!                             │ unanswered / failed
//!                    ┌────────▼────────┐
//!                    │   Fallback      │ ← one call per item,
//!                    │   (Semaphore)   │   fallback_concurrency
//!                    └─────────────────┘
//! ```
//!
//! Every caller holds a [`PendingResult`] that resolves exactly once.

mod config;
mod metrics;
mod pending;
mod queue;
mod scheduler;

pub use config::BatcherConfig;
pub use metrics::{AnsweredBySource, BatcherMetrics, MetricsSnapshot};
pub use pending::{channel, Completer, PendingResult};
pub use queue::{KeyQueue, KeyQueueState};
pub use scheduler::BatchScheduler;
