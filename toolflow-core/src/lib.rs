//! Flow engine for toolflow.
//!
//! A [`FlowDefinition`] is an ordered list of typed steps (model turn, tool
//! call, file read, approval). [`FlowEngine`] runs it against a
//! [`FlowContext`], dispatching each step to its collaborator: a
//! [`ChatProvider`](toolflow_llm::ChatProvider) for chat steps, the retrying
//! shell executor or a registered [`ToolHandler`] for tool calls, a
//! [`FileReader`] for reads, and an [`ApprovalGate`] for approvals.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod flow;
pub mod handlers;

pub use config::{ConfigLoader, LoadedConfig, ProviderKind, ToolflowConfig};
pub use context::{FlowContext, StepFailure};
pub use engine::{EngineOptions, FailedStep, FlowEngine, FlowReport, FlowState, StepOutcome, StepVisit};
pub use error::{FlowError, StepError};
pub use flow::{FlowDefinition, FlowDefinitionError, FlowStep, RetryBlock, StepKind};
pub use handlers::{
    ApprovalGate, ApprovalRequest, AutoApprove, AutoReject, FileReader, ShellTool, ToolHandler,
    ToolRegistry, WorkspaceFileReader,
};
