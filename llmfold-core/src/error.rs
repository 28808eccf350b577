//! Error types for the llmfold core library
//!
//! This module provides structured error types using `thiserror` for
//! type-safe error handling across the library.
//!
//! # Error Hierarchy
//!
//! ```text
//! CoreError
//! ├── InvalidRequest     - Request rejected at admission
//! ├── InvalidTransition  - Illegal batch state change
//! ├── NotOpen            - Item pushed into a closed batch
//! └── BatchFull          - Item pushed into a full batch
//! ```
//!
//! Token budgeting and response parsing never fail: over-budget prompts are
//! truncated and flagged, unparseable batch items are reported through
//! [`crate::assembler::ParseOutcome`].

use thiserror::Error;

use crate::batch::BatchState;

/// Errors produced by the core data model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// The request violates a data model invariant
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A batch was asked to move backwards or skip a state
    #[error("Invalid batch transition from {from} to {to}")]
    InvalidTransition {
        from: BatchState,
        to: BatchState,
    },

    /// Items can only join an open batch
    #[error("Batch is {0}, not open")]
    NotOpen(BatchState),

    #[error("Batch is full ({capacity} items)")]
    BatchFull { capacity: usize },
}

impl CoreError {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid transition error
    pub fn transition(from: BatchState, to: BatchState) -> Self {
        Self::InvalidTransition { from, to }
    }
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
