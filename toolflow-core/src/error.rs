use thiserror::Error;
use toolflow_bash_runner::{ExecError, RetryConfigError};
use toolflow_commons::ErrorCategory;
use toolflow_llm::StreamError;

use crate::flow::FlowDefinitionError;
use crate::handlers::ReadError;

/// Why a single step failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("chat turn failed after {attempts} attempt(s): {source}")]
    Chat {
        #[source]
        source: StreamError,
        attempts: u32,
    },
    #[error("invalid retry configuration: {0}")]
    Config(#[from] RetryConfigError),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool `{tool}` failed after {attempts} attempt(s): {error:#}")]
    Tool {
        tool: String,
        attempts: u32,
        category: ErrorCategory,
        error: anyhow::Error,
    },
    #[error("read failed after {attempts} attempt(s): {source}")]
    Read {
        #[source]
        source: ReadError,
        attempts: u32,
    },
    #[error("approval rejected: {message}")]
    Rejected { message: String },
    #[error("approval could not be obtained: {0:#}")]
    Approval(anyhow::Error),
}

impl StepError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Exec(err) => err.category(),
            Self::Chat { source, .. } => source.category(),
            Self::Config(_) | Self::UnknownTool(_) | Self::InvalidArguments { .. } => {
                ErrorCategory::InvalidRequest
            }
            Self::Tool { category, .. } => *category,
            Self::Read { source, .. } => source.category(),
            Self::Rejected { .. } => ErrorCategory::Cancelled,
            Self::Approval(_) => ErrorCategory::Unknown,
        }
    }

    /// Attempts consumed before giving up; 0 when nothing ran.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exec(err) => err.attempts(),
            Self::Chat { attempts, .. }
            | Self::Tool { attempts, .. }
            | Self::Read { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Rejections end the flow even when the step may continue on failure.
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid flow: {0}")]
    Invalid(#[from] FlowDefinitionError),
}
