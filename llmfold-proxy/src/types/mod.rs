//! API types for the llmfold proxy.

pub mod openai;
