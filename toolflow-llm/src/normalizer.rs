//! Adapts provider-native streams to canonical [`DeltaChunk`]s and drives a
//! turn to completion.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use toolflow_commons::{ErrorCategory, LLMError};

use crate::accumulator::{InvalidToolCall, PartialToolCall, ToolCallAccumulator};
use crate::provider::{ChatProvider, ProviderChunk, ProviderStream};
use crate::types::{ChatOptions, DeltaChunk, Message, ToolCall, ToolCallDelta};

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaChunk, LLMError>> + Send>>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream failed before producing output: {0}")]
    Transport(#[source] LLMError),
    #[error("stream failed after {chunks} chunk(s): {source}")]
    Partial {
        source: LLMError,
        chunks: usize,
        text: String,
        partial_calls: Vec<PartialToolCall>,
    },
    #[error("stream cancelled")]
    Cancelled {
        text: String,
        partial_calls: Vec<PartialToolCall>,
    },
}

impl StreamError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(source) | Self::Partial { source, .. } => ErrorCategory::from(source),
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
        }
    }

    /// Tool calls that were still being assembled when the stream stopped.
    pub fn partial_calls(&self) -> &[PartialToolCall] {
        match self {
            Self::Transport(_) => &[],
            Self::Partial { partial_calls, .. } | Self::Cancelled { partial_calls, .. } => {
                partial_calls.as_slice()
            }
        }
    }
}

/// Completed model turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub invalid_tool_calls: Vec<InvalidToolCall>,
    pub chunks: usize,
}

/// Lazily map provider chunks to canonical deltas. Delta-shaped chunks pass
/// through untouched; a message-shaped chunk becomes one terminal delta.
pub fn normalize(upstream: ProviderStream) -> DeltaStream {
    Box::pin(upstream.map(|item| item.map(into_delta)))
}

fn into_delta(chunk: ProviderChunk) -> DeltaChunk {
    match chunk {
        ProviderChunk::Delta(delta) => delta,
        ProviderChunk::Message { text, tool_calls } => DeltaChunk {
            text,
            tool_calls: tool_calls
                .into_iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta {
                    index,
                    id: Some(call.id),
                    name: Some(call.name),
                    arguments: Some(call.arguments),
                })
                .collect(),
        },
    }
}

/// Consume `stream` into a [`ChatTurn`]. Cancellation drops the upstream
/// without draining it.
pub async fn collect_turn(
    mut stream: DeltaStream,
    cancel: &CancellationToken,
) -> Result<ChatTurn, StreamError> {
    let mut text = String::new();
    let mut accumulator = ToolCallAccumulator::new();
    let mut chunks = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(chunks, "chat stream cancelled");
                return Err(StreamError::Cancelled {
                    text,
                    partial_calls: accumulator.snapshot(),
                });
            }
            next = stream.next() => next,
        };

        match next {
            None => break,
            Some(Ok(chunk)) => {
                chunks += 1;
                if let Some(fragment) = chunk.text.as_deref() {
                    text.push_str(fragment);
                }
                accumulator.push_chunk(&chunk);
            }
            Some(Err(source)) if chunks == 0 => return Err(StreamError::Transport(source)),
            Some(Err(source)) => {
                tracing::warn!(chunks, error = %source, "chat stream failed mid-turn");
                return Err(StreamError::Partial {
                    source,
                    chunks,
                    text,
                    partial_calls: accumulator.snapshot(),
                });
            }
        }
    }

    let accumulated = accumulator.finish();
    Ok(ChatTurn {
        text,
        tool_calls: accumulated.calls,
        invalid_tool_calls: accumulated.invalid,
        chunks,
    })
}

/// Request a completion from `provider` and collect it.
pub async fn run_turn(
    provider: &dyn ChatProvider,
    messages: &[Message],
    options: &ChatOptions,
    cancel: &CancellationToken,
) -> Result<ChatTurn, StreamError> {
    tracing::debug!(provider = provider.name(), messages = messages.len(), "starting chat turn");
    let upstream = provider
        .get_chat_completion(messages, options)
        .await
        .map_err(StreamError::Transport)?;
    collect_turn(normalize(upstream), cancel).await
}
