use std::time::Duration;

use serde_json::Value;
use toolflow_bash_runner::{CommandResult, RetryConfig, RetryExecutor};
use toolflow_exec_events::EventEmitter;

use crate::config::RetryDefaults;
use crate::error::StepError;
use crate::flow::{RetryBlock, SHELL_TOOL, ShellArgs};

/// `shell_exec` backed by a [`RetryExecutor`].
///
/// A retry block inside the tool arguments wins over the step retry block.
/// With neither, the command runs once through the same path.
#[derive(Clone)]
pub struct ShellTool {
    executor: RetryExecutor,
    defaults: RetryDefaults,
    default_timeout: Option<Duration>,
}

struct ShellPlan {
    command: String,
    timeout: Option<Duration>,
    retry: RetryConfig,
}

impl ShellTool {
    pub fn new(executor: RetryExecutor) -> Self {
        Self {
            executor,
            defaults: RetryDefaults::default(),
            default_timeout: None,
        }
    }

    pub fn with_retry_defaults(mut self, defaults: RetryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    fn plan(&self, args: &Value, step_retry: Option<&RetryBlock>) -> Result<ShellPlan, StepError> {
        let args = ShellArgs::from_value(args).map_err(|err| StepError::InvalidArguments {
            tool: SHELL_TOOL.to_string(),
            message: err.to_string(),
        })?;
        let retry = args
            .retry
            .as_ref()
            .or(step_retry)
            .map_or_else(RetryConfig::single, |block| {
                block.to_retry_config(&self.defaults)
            });
        let timeout = args
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout);
        Ok(ShellPlan {
            command: args.command,
            timeout,
            retry,
        })
    }

    /// Translate and policy-check without running anything.
    pub fn dry_run(
        &self,
        args: &Value,
        step_retry: Option<&RetryBlock>,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<String, StepError> {
        let plan = self.plan(args, step_retry)?;
        let native = self.executor.prepare(&plan.command, &plan.retry, emitter)?;
        let attempts = plan.retry.max_attempts;
        Ok(match plan.timeout {
            Some(timeout) => format!(
                "run `{native}` ({attempts} attempt(s) max, timeout {}ms)",
                timeout.as_millis()
            ),
            None => format!("run `{native}` ({attempts} attempt(s) max)"),
        })
    }

    pub async fn run(
        &self,
        args: &Value,
        step_retry: Option<&RetryBlock>,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<CommandResult, StepError> {
        let plan = self.plan(args, step_retry)?;
        let result = self
            .executor
            .execute(&plan.command, plan.timeout, Some(&plan.retry), emitter)
            .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use toolflow_bash_runner::{CommandTranslator, PatternPolicy, ShellKind};
    use toolflow_commons::ErrorCategory;
    use toolflow_exec_events::{ExecEvent, MemoryEmitter};

    fn tool(shell: ShellKind) -> ShellTool {
        let policy = PatternPolicy::new(["rm -rf"]).unwrap();
        ShellTool::new(
            RetryExecutor::new(".")
                .with_translator(CommandTranslator::new(shell))
                .with_policy(Arc::new(policy)),
        )
        .with_default_timeout(Some(Duration::from_secs(5)))
    }

    #[test]
    fn dry_run_reports_native_command() {
        let mut events = MemoryEmitter::new();
        let summary = tool(ShellKind::Windows)
            .dry_run(&json!({"command": "test -f package.json"}), None, &mut events)
            .unwrap();
        assert_eq!(
            summary,
            "run `if (Test-Path -LiteralPath 'package.json' -PathType Leaf) { exit 0 } else { exit 1 }` \
             (1 attempt(s) max, timeout 5000ms)"
        );
        assert!(events.is_empty());
    }

    #[test]
    fn args_retry_overrides_step_retry() {
        let step_retry = RetryBlock {
            max_attempts: 2,
            ..RetryBlock::default()
        };
        let mut events = MemoryEmitter::new();
        let summary = tool(ShellKind::Unix)
            .dry_run(
                &json!({"command": "ls", "timeoutMs": 100, "retry": {"maxAttempts": 4}}),
                Some(&step_retry),
                &mut events,
            )
            .unwrap();
        assert_eq!(summary, "run `ls` (4 attempt(s) max, timeout 100ms)");
    }

    #[test]
    fn dry_run_still_applies_policy() {
        let mut events = MemoryEmitter::new();
        let err = tool(ShellKind::Unix)
            .dry_run(&json!({"command": "rm -rf /tmp/x"}), None, &mut events)
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::PolicyDenied);
        assert_eq!(err.attempts(), 0);
        let recorded = events.events();
        assert!(matches!(recorded.as_slice(), [ExecEvent::CommandDenied(_)]));
    }

    #[test]
    fn malformed_args_are_rejected() {
        let err = tool(ShellKind::Unix)
            .dry_run(&json!({"cmd": "ls"}), None, &mut MemoryEmitter::new())
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidArguments { .. }));
    }
}
