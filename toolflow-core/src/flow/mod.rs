//! Declarative flow descriptions.
//!
//! A flow is an ordered list of typed steps, accepted as JSON
//! (`{"steps": [...]}`) or TOML (`[[steps]]` tables).

mod step;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolflow_bash_runner::RetryConfigError;

use crate::config::RetryDefaults;

pub use step::{
    ApprovalStep, ChatStep, FlowStep, ReadFileStep, RetryBlock, SHELL_TOOL, ShellArgs, StepKind,
    ToolCallStep,
};

#[derive(Debug, Error)]
pub enum FlowDefinitionError {
    #[error("failed to read flow file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON flow: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML flow: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("step {index}: {message}")]
    Step { index: usize, message: String },
    #[error("step {index}: invalid retry configuration: {source}")]
    Retry {
        index: usize,
        #[source]
        source: RetryConfigError,
    },
    #[error("duplicate step id `{0}`")]
    DuplicateId(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FlowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

impl FlowDefinition {
    pub fn new(steps: Vec<FlowStep>) -> Self {
        Self { name: None, steps }
    }

    pub fn from_json(text: &str) -> Result<Self, FlowDefinitionError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self, FlowDefinitionError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a flow file, choosing the format from its extension. Anything
    /// other than `.toml` is parsed as JSON.
    pub fn load(path: &Path) -> Result<Self, FlowDefinitionError> {
        let text = std::fs::read_to_string(path).map_err(|source| FlowDefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml(&text)
        } else {
            Self::from_json(&text)
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check structure and every retry block before anything runs.
    pub fn validate(&self, defaults: &RetryDefaults) -> Result<(), FlowDefinitionError> {
        let mut ids = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(id) = &step.id {
                if id.trim().is_empty() {
                    return Err(step_error(index, "step id must not be empty"));
                }
                if !ids.insert(id.as_str()) {
                    return Err(FlowDefinitionError::DuplicateId(id.clone()));
                }
            }
            if let Some(retry) = &step.retry {
                check_retry(index, retry, defaults)?;
            }
            match &step.kind {
                StepKind::Chat(chat) if chat.prompt.trim().is_empty() => {
                    return Err(step_error(index, "chat prompt must not be empty"));
                }
                StepKind::ToolCall(call) => {
                    if call.tool.trim().is_empty() {
                        return Err(step_error(index, "tool name must not be empty"));
                    }
                    if call.tool == SHELL_TOOL {
                        let args = ShellArgs::from_value(&call.args).map_err(|err| {
                            step_error(index, format!("invalid {SHELL_TOOL} arguments: {err}"))
                        })?;
                        if let Some(retry) = &args.retry {
                            check_retry(index, retry, defaults)?;
                        }
                    } else if !(call.args.is_object() || call.args.is_null()) {
                        return Err(step_error(index, "tool arguments must be an object"));
                    }
                }
                StepKind::ReadFile(read) => {
                    if read.path.trim().is_empty() {
                        return Err(step_error(index, "read_file path must not be empty"));
                    }
                    if read.max_bytes == Some(0) {
                        return Err(step_error(index, "read_file maxBytes must be positive"));
                    }
                }
                StepKind::Approval(_) | StepKind::Chat(_) => {}
            }
        }
        Ok(())
    }
}

fn step_error(index: usize, message: impl Into<String>) -> FlowDefinitionError {
    FlowDefinitionError::Step {
        index,
        message: message.into(),
    }
}

fn check_retry(
    index: usize,
    retry: &RetryBlock,
    defaults: &RetryDefaults,
) -> Result<(), FlowDefinitionError> {
    retry
        .to_retry_config(defaults)
        .validate()
        .map_err(|source| FlowDefinitionError::Retry { index, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn json_and_toml_describe_the_same_flow() {
        let from_json = FlowDefinition::from_json(
            r#"{"steps": [
                {"type": "chat", "prompt": "Summarize {{notes.content}}"},
                {"type": "tool_call", "tool": "shell_exec",
                 "args": {"command": "ls"}, "retry": {"maxAttempts": 2, "continueOnFailure": true}},
                {"type": "approval", "message": "Proceed?"}
            ]}"#,
        )
        .unwrap();
        let from_toml = FlowDefinition::from_toml(
            r#"
[[steps]]
type = "chat"
prompt = "Summarize {{notes.content}}"

[[steps]]
type = "tool_call"
tool = "shell_exec"
args = { command = "ls" }
retry = { maxAttempts = 2, continueOnFailure = true }

[[steps]]
type = "approval"
message = "Proceed?"
"#,
        )
        .unwrap();

        assert_eq!(from_json, from_toml);
        assert_eq!(from_json.len(), 3);
        from_json.validate(&RetryDefaults::default()).unwrap();
    }

    #[test]
    fn out_of_range_retry_is_a_configuration_error() {
        let flow = FlowDefinition::new(vec![
            FlowStep::chat("hi").with_retry(RetryBlock {
                max_attempts: 11,
                ..RetryBlock::default()
            }),
        ]);
        let err = flow.validate(&RetryDefaults::default()).unwrap_err();
        assert!(matches!(
            err,
            FlowDefinitionError::Retry {
                index: 0,
                source: RetryConfigError::MaxAttempts(11)
            }
        ));

        let flow = FlowDefinition::new(vec![FlowStep::tool_call(
            SHELL_TOOL,
            json!({"command": "ls", "retry": {"maxAttempts": 2, "delayMs": 60001}}),
        )]);
        assert!(matches!(
            flow.validate(&RetryDefaults::default()),
            Err(FlowDefinitionError::Retry { index: 0, .. })
        ));
    }

    #[test]
    fn structural_problems_are_reported_per_step() {
        let defaults = RetryDefaults::default();
        let missing_command =
            FlowDefinition::new(vec![FlowStep::tool_call(SHELL_TOOL, json!({"timeoutMs": 5}))]);
        assert!(matches!(
            missing_command.validate(&defaults),
            Err(FlowDefinitionError::Step { index: 0, .. })
        ));

        let duplicate = FlowDefinition::new(vec![
            FlowStep::chat("a").with_id("x"),
            FlowStep::read_file("b").with_id("x"),
        ]);
        assert!(matches!(
            duplicate.validate(&defaults),
            Err(FlowDefinitionError::DuplicateId(id)) if id == "x"
        ));
    }

    #[test]
    fn unknown_step_type_fails_to_parse() {
        let err = FlowDefinition::from_json(r#"{"steps": [{"type": "teleport"}]}"#).unwrap_err();
        assert!(matches!(err, FlowDefinitionError::Json(_)));
    }
}
