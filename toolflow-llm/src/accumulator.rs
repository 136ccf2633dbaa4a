//! Merges streamed tool-call fragments into complete calls.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{DeltaChunk, ToolCall, ToolCallDelta};

/// In-progress state for one tool-call index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartialToolCall {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

impl PartialToolCall {
    fn apply(&mut self, delta: &ToolCallDelta) {
        // Set once; a later fragment without an id never clears it.
        if self.id.is_none()
            && let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty())
        {
            self.id = Some(id.to_string());
        }
        if let Some(fragment) = delta.name.as_deref() {
            self.name.get_or_insert_with(String::new).push_str(fragment);
        }
        if let Some(fragment) = delta.arguments.as_deref() {
            self.arguments.push_str(fragment);
        }
    }

    fn finalize(self) -> Result<ToolCall, InvalidToolCall> {
        let name = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let Some(name) = name else {
            return Err(InvalidToolCall {
                reason: InvalidReason::MissingName,
                call: self,
            });
        };

        let arguments = if self.arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            self.arguments.clone()
        };
        if let Err(err) = serde_json::from_str::<serde_json::Value>(&arguments) {
            return Err(InvalidToolCall {
                reason: InvalidReason::MalformedArguments(err.to_string()),
                call: self,
            });
        }

        let id = self
            .id
            .unwrap_or_else(|| format!("tool_call_{}", self.index));
        Ok(ToolCall {
            id,
            name,
            arguments,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum InvalidReason {
    MissingName,
    MalformedArguments(String),
}

/// A call that could not be completed at stream end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidToolCall {
    pub call: PartialToolCall,
    pub reason: InvalidReason,
}

impl std::fmt::Display for InvalidToolCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            InvalidReason::MissingName => {
                write!(f, "tool call #{} has no function name", self.call.index)
            }
            InvalidReason::MalformedArguments(err) => write!(
                f,
                "tool call #{} ({}) has malformed arguments: {err}",
                self.call.index,
                self.call.name.as_deref().unwrap_or("?")
            ),
        }
    }
}

/// Result of draining an accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccumulatedCalls {
    /// Complete calls in ascending index order.
    pub calls: Vec<ToolCall>,
    pub invalid: Vec<InvalidToolCall>,
}

/// Accumulation state for one stream. Create one per turn and consume it
/// with [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    partials: BTreeMap<usize, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &ToolCallDelta) {
        self.partials
            .entry(delta.index)
            .or_insert_with(|| PartialToolCall {
                index: delta.index,
                ..PartialToolCall::default()
            })
            .apply(delta);
    }

    pub fn push_chunk(&mut self, chunk: &DeltaChunk) {
        for delta in &chunk.tool_calls {
            self.push(delta);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    /// Current partial state, ordered by index. Nothing here is final.
    pub fn snapshot(&self) -> Vec<PartialToolCall> {
        self.partials.values().cloned().collect()
    }

    /// Validate every accumulated call. Invalid calls are reported, never
    /// dropped.
    pub fn finish(self) -> AccumulatedCalls {
        let mut out = AccumulatedCalls::default();
        for partial in self.partials.into_values() {
            match partial.finalize() {
                Ok(call) => out.calls.push(call),
                Err(invalid) => {
                    tracing::debug!(%invalid, "discarding incomplete tool call");
                    out.invalid.push(invalid);
                }
            }
        }
        out
    }
}
