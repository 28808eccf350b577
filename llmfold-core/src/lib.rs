// llmfold Core Library
//
// Token budgeting, compatibility classification and batch assembly for the
// llmfold request-batching proxy. Everything here is synchronous and free of I/O.

pub mod assembler;
pub mod batch;
pub mod budget;
pub mod classifier;
pub mod error;
pub mod fingerprint;
pub mod tokens;
pub mod types;

pub use assembler::{BatchAssembler, ParseOutcome};
pub use batch::{BatchItem, BatchJob, BatchState};
pub use budget::{BudgetReport, BudgetedPrompt, PromptBudgeter};
pub use classifier::{classify, CompatibilityClassifier, CompatibilityKey};
pub use error::CoreError;
pub use fingerprint::Fingerprint;
pub use tokens::TokenEstimator;
pub use types::{ChatRequest, ChatResponse, Message, Prompt, RequestId, ResponseSource, Role};
