//! Provider-agnostic chat streaming for toolflow.
//!
//! Providers implement [`ChatProvider`] and yield their native chunk shape.
//! [`normalize`] turns that into canonical [`DeltaChunk`]s, and
//! [`collect_turn`] folds the stream into text plus fully merged
//! [`ToolCall`]s using a per-stream [`ToolCallAccumulator`].

pub mod accumulator;
pub mod normalizer;
pub mod provider;
pub mod providers;
pub mod types;

pub use accumulator::{
    AccumulatedCalls, InvalidReason, InvalidToolCall, PartialToolCall, ToolCallAccumulator,
};
pub use normalizer::{ChatTurn, DeltaStream, StreamError, collect_turn, normalize, run_turn};
pub use provider::{ChatProvider, ProviderChunk, ProviderStream};
pub use toolflow_commons::LLMError;
pub use types::{ChatOptions, DeltaChunk, Message, Role, ToolCall, ToolCallDelta, ToolDefinition};
