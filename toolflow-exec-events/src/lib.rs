//! Structured execution telemetry events shared across toolflow crates.
//!
//! This crate exposes the serialized schema for retry timelines (attempt
//! start, wait, success, exhaustion, policy denial) and for flow lifecycle
//! updates. Every event carries enough data to reconstruct what happened
//! without re-running it, so downstream consumers can deserialize a stream
//! of these to drive audit logs or dashboards.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use toolflow_commons::ErrorCategory;

/// Semantic version of the serialized event schema exported by this crate.
pub const EVENT_SCHEMA_VERSION: &str = "0.1.0";

/// Wraps an [`ExecEvent`] with schema metadata so downstream consumers can
/// negotiate compatibility before processing an event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedExecEvent {
    /// Semantic version describing the schema of the nested event payload.
    pub schema_version: String,
    /// Concrete event emitted by the runtime.
    pub event: ExecEvent,
}

impl VersionedExecEvent {
    /// Creates a new [`VersionedExecEvent`] using the current
    /// [`EVENT_SCHEMA_VERSION`].
    pub fn new(event: ExecEvent) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            event,
        }
    }

    /// Returns the nested [`ExecEvent`], consuming the wrapper.
    pub fn into_event(self) -> ExecEvent {
        self.event
    }
}

impl From<ExecEvent> for VersionedExecEvent {
    fn from(event: ExecEvent) -> Self {
        Self::new(event)
    }
}

/// Sink for processing [`ExecEvent`] instances.
pub trait EventEmitter {
    /// Invoked for each event, before the emitting component proceeds.
    fn emit(&mut self, event: &ExecEvent);
}

impl<F> EventEmitter for F
where
    F: FnMut(&ExecEvent),
{
    fn emit(&mut self, event: &ExecEvent) {
        self(event);
    }
}

/// Emitter that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&mut self, _event: &ExecEvent) {}
}

/// Records events in memory. Clones share the same buffer, so a caller can
/// hand one clone to the engine and read the timeline from another.
#[derive(Debug, Default, Clone)]
pub struct MemoryEmitter {
    events: Arc<Mutex<Vec<ExecEvent>>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventEmitter for MemoryEmitter {
    fn emit(&mut self, event: &ExecEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards every event to each inner emitter in registration order.
#[derive(Default)]
pub struct FanoutEmitter {
    emitters: Vec<Box<dyn EventEmitter + Send>>,
}

impl FanoutEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, emitter: impl EventEmitter + Send + 'static) -> Self {
        self.emitters.push(Box::new(emitter));
        self
    }
}

impl EventEmitter for FanoutEmitter {
    fn emit(&mut self, event: &ExecEvent) {
        for emitter in &mut self.emitters {
            emitter.emit(event);
        }
    }
}

/// JSON helper utilities for serializing and deserializing events.
#[cfg(feature = "serde-json")]
pub mod json {
    use super::{ExecEvent, VersionedExecEvent};

    /// Converts an event into a `serde_json::Value`.
    pub fn to_value(event: &ExecEvent) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(event)
    }

    /// Serializes an event into a JSON string.
    pub fn to_string(event: &ExecEvent) -> serde_json::Result<String> {
        serde_json::to_string(event)
    }

    /// Deserializes an event from a JSON string.
    pub fn from_str(payload: &str) -> serde_json::Result<ExecEvent> {
        serde_json::from_str(payload)
    }

    /// Serializes a [`VersionedExecEvent`] wrapper.
    pub fn versioned_to_string(event: &ExecEvent) -> serde_json::Result<String> {
        serde_json::to_string(&VersionedExecEvent::new(event.clone()))
    }

    /// Deserializes a [`VersionedExecEvent`] wrapper.
    pub fn versioned_from_str(payload: &str) -> serde_json::Result<VersionedExecEvent> {
        serde_json::from_str(payload)
    }
}

#[cfg(feature = "telemetry-tracing")]
mod tracing_support {
    use tracing::Level;

    use super::{EVENT_SCHEMA_VERSION, EventEmitter, ExecEvent, VersionedExecEvent};

    /// Emits structured events as `tracing` events at the specified level.
    #[derive(Debug, Clone)]
    pub struct TracingEmitter {
        level: Level,
    }

    impl TracingEmitter {
        /// Creates a new [`TracingEmitter`] with the provided [`Level`].
        pub fn new(level: Level) -> Self {
            Self { level }
        }
    }

    impl Default for TracingEmitter {
        fn default() -> Self {
            Self { level: Level::INFO }
        }
    }

    impl EventEmitter for TracingEmitter {
        fn emit(&mut self, event: &ExecEvent) {
            match self.level {
                Level::TRACE => tracing::event!(
                    target: "toolflow_exec_events",
                    Level::TRACE,
                    schema_version = EVENT_SCHEMA_VERSION,
                    event = ?VersionedExecEvent::new(event.clone()),
                    "toolflow_exec_event"
                ),
                Level::DEBUG => tracing::event!(
                    target: "toolflow_exec_events",
                    Level::DEBUG,
                    schema_version = EVENT_SCHEMA_VERSION,
                    event = ?VersionedExecEvent::new(event.clone()),
                    "toolflow_exec_event"
                ),
                Level::INFO => tracing::event!(
                    target: "toolflow_exec_events",
                    Level::INFO,
                    schema_version = EVENT_SCHEMA_VERSION,
                    event = ?VersionedExecEvent::new(event.clone()),
                    "toolflow_exec_event"
                ),
                Level::WARN => tracing::event!(
                    target: "toolflow_exec_events",
                    Level::WARN,
                    schema_version = EVENT_SCHEMA_VERSION,
                    event = ?VersionedExecEvent::new(event.clone()),
                    "toolflow_exec_event"
                ),
                Level::ERROR => tracing::event!(
                    target: "toolflow_exec_events",
                    Level::ERROR,
                    schema_version = EVENT_SCHEMA_VERSION,
                    event = ?VersionedExecEvent::new(event.clone()),
                    "toolflow_exec_event"
                ),
            }
        }
    }

    pub use TracingEmitter as PublicTracingEmitter;
}

#[cfg(feature = "telemetry-tracing")]
pub use tracing_support::PublicTracingEmitter as TracingEmitter;

/// Structured events emitted by the retry loop and the flow engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ExecEvent {
    /// An attempt is about to run.
    #[serde(rename = "attempt.started")]
    AttemptStarted(AttemptStartedEvent),
    /// An attempt finished unsuccessfully.
    #[serde(rename = "attempt.failed")]
    AttemptFailed(AttemptFailedEvent),
    /// The loop is sleeping before the next attempt.
    #[serde(rename = "attempt.waiting")]
    AttemptWaiting(AttemptWaitingEvent),
    /// An attempt succeeded; the loop is done.
    #[serde(rename = "attempt.succeeded")]
    AttemptSucceeded(AttemptSucceededEvent),
    /// Every allowed attempt failed with a retryable error.
    #[serde(rename = "attempts.exhausted")]
    AttemptsExhausted(AttemptsTerminalEvent),
    /// A non-retryable failure stopped the loop early.
    #[serde(rename = "attempts.aborted")]
    AttemptsAborted(AttemptsTerminalEvent),
    /// The command policy rejected a command; nothing was executed.
    #[serde(rename = "command.denied")]
    CommandDenied(CommandDeniedEvent),
    /// A flow definition failed validation; no step ran.
    #[serde(rename = "flow.invalid")]
    FlowInvalid(FlowInvalidEvent),
    /// A flow run began.
    #[serde(rename = "flow.started")]
    FlowStarted(FlowStartedEvent),
    /// A step is being dispatched.
    #[serde(rename = "step.started")]
    StepStarted(StepEvent),
    /// A step finished successfully (or was simulated in dry-run mode).
    #[serde(rename = "step.completed")]
    StepCompleted(StepCompletedEvent),
    /// A step failed.
    #[serde(rename = "step.failed")]
    StepFailed(StepFailedEvent),
    /// A flow reached a terminal state.
    #[serde(rename = "flow.finished")]
    FlowFinished(FlowFinishedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptStartedEvent {
    /// What is being attempted (the native command, or `chat:<provider>`).
    pub operation: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptFailedEvent {
    pub operation: String,
    pub attempt: u32,
    pub category: ErrorCategory,
    /// Process exit code, when the failure came from a process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptWaitingEvent {
    pub operation: String,
    /// The attempt that will run once the delay elapses.
    pub next_attempt: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptSucceededEvent {
    pub operation: String,
    pub attempt_count: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptsTerminalEvent {
    pub operation: String,
    pub attempt_count: u32,
    pub category: ErrorCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandDeniedEvent {
    /// Native command that was rejected.
    pub command: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowStartedEvent {
    pub run_id: String,
    pub step_count: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowInvalidEvent {
    pub step_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepEvent {
    pub index: usize,
    /// Step variant (`chat`, `tool_call`, `read_file`, `approval`).
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepCompletedEvent {
    #[serde(flatten)]
    pub step: StepEvent,
    /// Present in dry-run mode: what the step would have done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailedEvent {
    #[serde(flatten)]
    pub step: StepEvent,
    pub category: ErrorCategory,
    pub message: String,
    /// Whether the flow recorded the failure and moved on.
    pub continued: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowFinishedEvent {
    pub run_id: String,
    /// Terminal state (`completed`, `failed`, `aborted`).
    pub state: String,
    pub steps_visited: usize,
}

impl ExecEvent {
    /// The operation label for retry-loop events.
    pub fn operation(&self) -> Option<&str> {
        match self {
            ExecEvent::AttemptStarted(event) => Some(&event.operation),
            ExecEvent::AttemptFailed(event) => Some(&event.operation),
            ExecEvent::AttemptWaiting(event) => Some(&event.operation),
            ExecEvent::AttemptSucceeded(event) => Some(&event.operation),
            ExecEvent::AttemptsExhausted(event) | ExecEvent::AttemptsAborted(event) => {
                Some(&event.operation)
            }
            ExecEvent::CommandDenied(event) => Some(&event.command),
            _ => None,
        }
    }
}
