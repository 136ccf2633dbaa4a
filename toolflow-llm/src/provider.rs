use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use toolflow_commons::LLMError;

use crate::types::{ChatOptions, DeltaChunk, Message, ToolCall};

/// Native chunk shapes a provider may yield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderChunk {
    /// Already in the canonical incremental shape.
    Delta(DeltaChunk),
    /// Message-oriented providers deliver the whole turn at once.
    Message {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk, LLMError>> + Send>>;

/// Capability interface every chat backend implements. The flow engine and
/// the normalizer only ever see this trait.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start a chat completion. Errors returned here happen before any
    /// chunk was produced (connection, status code).
    async fn get_chat_completion(
        &self,
        messages: &[Message],
        options: &ChatOptions,
    ) -> Result<ProviderStream, LLMError>;
}
