//! Deterministic provider for tests and offline runs.
//!
//! Turns are queued up front and replayed in FIFO order, one per
//! `get_chat_completion` call. Each turn can use the delta or the message
//! shape, fail before streaming, or fail part way through.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use toolflow_commons::LLMError;

use crate::provider::{ChatProvider, ProviderChunk, ProviderStream};
use crate::types::{ChatOptions, DeltaChunk, Message, ToolCall, ToolCallDelta};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream these items in order.
    Stream(Vec<Result<ProviderChunk, LLMError>>),
    /// Fail the request before any chunk is produced.
    Reject(LLMError),
}

impl ScriptedTurn {
    /// Text split into word-sized delta chunks.
    pub fn text(text: &str) -> Self {
        let chunks = text
            .split_inclusive(' ')
            .map(|word| Ok(ProviderChunk::Delta(DeltaChunk::text(word))))
            .collect();
        Self::Stream(chunks)
    }

    pub fn deltas(chunks: impl IntoIterator<Item = DeltaChunk>) -> Self {
        Self::Stream(chunks.into_iter().map(|c| Ok(ProviderChunk::Delta(c))).collect())
    }

    /// Whole turn in a single message-shaped chunk.
    pub fn message(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Stream(vec![Ok(ProviderChunk::Message {
            text: Some(text.into()),
            tool_calls,
        })])
    }

    /// A single tool call streamed as name and argument fragments of
    /// `fragment_len` bytes, the way delta-oriented providers emit them.
    pub fn tool_call(id: &str, name: &str, arguments: &str, fragment_len: usize) -> Self {
        let mut chunks = vec![DeltaChunk::tool_calls([ToolCallDelta::new(0)
            .with_id(id)
            .with_name(name)])];
        let mut rest = arguments;
        while !rest.is_empty() {
            let mut split = fragment_len.max(1).min(rest.len());
            while !rest.is_char_boundary(split) {
                split += 1;
            }
            let (head, tail) = rest.split_at(split);
            chunks.push(DeltaChunk::tool_calls([ToolCallDelta::new(0).with_arguments(head)]));
            rest = tail;
        }
        Self::deltas(chunks)
    }

    pub fn reject(error: LLMError) -> Self {
        Self::Reject(error)
    }

    /// Append a transport failure after the scripted chunks.
    pub fn then_fail(self, error: LLMError) -> Self {
        match self {
            Self::Stream(mut items) => {
                items.push(Err(error));
                Self::Stream(items)
            }
            reject @ Self::Reject(_) => reject,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turn(self, turn: ScriptedTurn) -> Self {
        self.turns.lock().push_back(turn);
        self
    }

    pub fn enqueue(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }

    /// Message lists received so far, one entry per call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn get_chat_completion(
        &self,
        messages: &[Message],
        _options: &ChatOptions,
    ) -> Result<ProviderStream, LLMError> {
        self.requests.lock().push(messages.to_vec());
        let turn = self.turns.lock().pop_front();
        match turn {
            Some(ScriptedTurn::Stream(items)) => Ok(Box::pin(stream::iter(items))),
            Some(ScriptedTurn::Reject(error)) => Err(error),
            None => Err(LLMError::InvalidRequest {
                message: "scripted provider has no queued turns".to_string(),
                metadata: None,
            }),
        }
    }
}
