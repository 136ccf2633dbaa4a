//! Shared contracts reused across the toolflow crates. The goal is to keep
//! the runner, the provider layer, and the flow engine decoupled from one
//! another while still agreeing on how failures are classified.

pub mod error_category;
pub mod llm;

pub use error_category::{
    ErrorCategory, category_for_status, classify_anyhow_error, classify_error_message,
    classify_exit,
};
pub use llm::{LLMError, LLMErrorMetadata};
