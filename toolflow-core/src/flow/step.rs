use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolflow_bash_runner::RetryConfig;

use crate::config::RetryDefaults;

/// Name of the built-in shell tool.
pub const SHELL_TOOL: &str = "shell_exec";

/// Per-step retry block as written in a flow description.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBlock {
    #[serde(default = "RetryBlock::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

impl Default for RetryBlock {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            delay_ms: None,
            continue_on_failure: false,
            backoff_multiplier: None,
            max_delay_ms: None,
            jitter: None,
        }
    }
}

impl RetryBlock {
    const fn default_max_attempts() -> u32 {
        1
    }

    /// Resolve against configured defaults. The result is not validated.
    pub fn to_retry_config(&self, defaults: &RetryDefaults) -> RetryConfig {
        let initial = Duration::from_millis(self.delay_ms.unwrap_or(defaults.delay_ms));
        let cap = self
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(defaults.max_delay_ms).max(initial));
        RetryConfig::new(self.max_attempts, initial)
            .with_multiplier(self.backoff_multiplier.unwrap_or(defaults.backoff_multiplier))
            .with_jitter(self.jitter.unwrap_or(defaults.jitter))
            .with_max_delay(cap)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatStep {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolCallStep {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileStep {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApprovalStep {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Chat(ChatStep),
    ToolCall(ToolCallStep),
    ReadFile(ReadFileStep),
    Approval(ApprovalStep),
}

impl StepKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::ToolCall(_) => "tool_call",
            Self::ReadFile(_) => "read_file",
            Self::Approval(_) => "approval",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlowStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryBlock>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl FlowStep {
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: None,
            retry: None,
            kind,
        }
    }

    pub fn chat(prompt: impl Into<String>) -> Self {
        Self::new(StepKind::Chat(ChatStep {
            prompt: prompt.into(),
            system: None,
        }))
    }

    pub fn tool_call(tool: impl Into<String>, args: Value) -> Self {
        Self::new(StepKind::ToolCall(ToolCallStep {
            tool: tool.into(),
            args,
        }))
    }

    pub fn read_file(path: impl Into<String>) -> Self {
        Self::new(StepKind::ReadFile(ReadFileStep {
            path: path.into(),
            max_bytes: None,
        }))
    }

    pub fn approval(message: impl Into<String>) -> Self {
        Self::new(StepKind::Approval(ApprovalStep {
            message: message.into(),
        }))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryBlock) -> Self {
        self.retry = Some(retry);
        self
    }

    pub const fn kind_name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Context key the step writes its result under.
    pub fn key(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("step_{index}"))
    }

    /// Set by the step retry block or, for `shell_exec`, by the retry
    /// block inside the tool arguments.
    pub fn continue_on_failure(&self) -> bool {
        if self
            .retry
            .as_ref()
            .is_some_and(|retry| retry.continue_on_failure)
        {
            return true;
        }
        match &self.kind {
            StepKind::ToolCall(call) if call.tool == SHELL_TOOL => ShellArgs::from_value(&call.args)
                .ok()
                .and_then(|args| args.retry)
                .is_some_and(|retry| retry.continue_on_failure),
            _ => false,
        }
    }
}

/// Arguments accepted by the `shell_exec` tool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellArgs {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryBlock>,
}

impl ShellArgs {
    pub fn from_value(args: &Value) -> serde_json::Result<Self> {
        Self::deserialize(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_tagged_steps_with_camel_case_fields() {
        let step: FlowStep = serde_json::from_value(json!({
            "type": "read_file",
            "id": "notes",
            "path": "notes.txt",
            "maxBytes": 64,
            "retry": {"maxAttempts": 2, "delayMs": 10, "continueOnFailure": true}
        }))
        .unwrap();

        assert_eq!(step.id.as_deref(), Some("notes"));
        assert_eq!(step.kind_name(), "read_file");
        assert!(step.continue_on_failure());
        assert_eq!(
            step.kind,
            StepKind::ReadFile(ReadFileStep {
                path: "notes.txt".into(),
                max_bytes: Some(64),
            })
        );
    }

    #[test]
    fn retry_block_falls_back_to_defaults() {
        let defaults = RetryDefaults::default();
        let config = RetryBlock {
            max_attempts: 3,
            delay_ms: Some(1000),
            ..RetryBlock::default()
        }
        .to_retry_config(&defaults);

        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(1000));
        assert_eq!(config.multiplier, defaults.backoff_multiplier);
        assert_eq!(config.max_delay, Duration::from_millis(defaults.max_delay_ms));
        config.validate().unwrap();
    }

    #[test]
    fn long_initial_delay_raises_default_cap() {
        let config = RetryBlock {
            max_attempts: 2,
            delay_ms: Some(45_000),
            ..RetryBlock::default()
        }
        .to_retry_config(&RetryDefaults::default());
        assert_eq!(config.max_delay, Duration::from_millis(45_000));
        config.validate().unwrap();
    }

    #[test]
    fn step_key_defaults_to_position() {
        assert_eq!(FlowStep::chat("hi").key(2), "step_2");
        assert_eq!(FlowStep::chat("hi").with_id("greet").key(2), "greet");
    }

    #[test]
    fn shell_args_accept_nested_retry() {
        let args = ShellArgs::from_value(&json!({
            "command": "curl https://example.com",
            "timeoutMs": 500,
            "retry": {"maxAttempts": 3, "delayMs": 1000}
        }))
        .unwrap();
        assert_eq!(args.timeout_ms, Some(500));
        assert_eq!(args.retry.map(|retry| retry.max_attempts), Some(3));
        assert!(ShellArgs::from_value(&json!({"cmd": "ls"})).is_err());
    }

    #[test]
    fn shell_retry_block_can_continue_on_failure() {
        let step = FlowStep::tool_call(
            SHELL_TOOL,
            json!({"command": "false", "retry": {"maxAttempts": 1, "continueOnFailure": true}}),
        );
        assert!(step.continue_on_failure());
        assert!(!FlowStep::tool_call(SHELL_TOOL, json!({"command": "false"})).continue_on_failure());
    }
}
