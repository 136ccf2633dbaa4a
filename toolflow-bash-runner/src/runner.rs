use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use toolflow_commons::{ErrorCategory, classify_anyhow_error, classify_exit};
use toolflow_exec_events::{CommandDeniedEvent, EventEmitter, ExecEvent};

use crate::executor::{
    CommandExecutor, CommandInvocation, CommandOutput, DEFAULT_CAPTURE_LIMIT,
    ProcessCommandExecutor,
};
use crate::policy::{AllowAllPolicy, CommandPolicy};
use crate::retry::{AttemptFailure, RetryConfig, RetryConfigError, run_with_retry};
use crate::translate::CommandTranslator;

/// Outcome of executing one portable command, possibly over several attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Portable command as authored.
    pub command: String,
    /// Command text handed to the host shell.
    pub native_command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub attempts: u32,
    pub timed_out: bool,
    pub truncated: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    fn from_output(command: &str, native: &str, output: CommandOutput) -> Self {
        Self {
            command: command.to_string(),
            native_command: native.to_string(),
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed: output.duration,
            attempts: 0,
            timed_out: output.timed_out,
            truncated: output.truncated,
        }
    }

    fn launch_failure(command: &str, native: &str, message: String) -> Self {
        Self {
            command: command.to_string(),
            native_command: native.to_string(),
            exit_code: None,
            stdout: String::new(),
            stderr: message,
            elapsed: Duration::ZERO,
            attempts: 0,
            timed_out: false,
            truncated: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid retry configuration: {0}")]
    Config(#[from] RetryConfigError),
    #[error("command `{command}` denied by policy: {reason}")]
    Denied { command: String, reason: String },
    #[error("command `{}` failed after {} attempt(s) ({category})", .result.command, .result.attempts)]
    Failed {
        result: Box<CommandResult>,
        category: ErrorCategory,
        /// `false` when a non-retryable category ended the loop early.
        exhausted: bool,
    },
}

impl ExecError {
    /// Attempts consumed; denials and config errors never execute.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { result, .. } => result.attempts,
            Self::Config(_) | Self::Denied { .. } => 0,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Failed { category, .. } => *category,
            Self::Denied { .. } => ErrorCategory::PolicyDenied,
            Self::Config(_) => ErrorCategory::InvalidRequest,
        }
    }

    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            Self::Failed { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Translate, gate, and run commands with retries.
#[derive(Clone)]
pub struct RetryExecutor {
    translator: CommandTranslator,
    policy: Arc<dyn CommandPolicy>,
    executor: Arc<dyn CommandExecutor>,
    working_dir: PathBuf,
    capture_limit: usize,
}

impl RetryExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            translator: CommandTranslator::for_host(),
            policy: Arc::new(AllowAllPolicy),
            executor: Arc::new(ProcessCommandExecutor::new()),
            working_dir: working_dir.into(),
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    pub fn with_translator(mut self, translator: CommandTranslator) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn CommandPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }

    pub fn translator(&self) -> &CommandTranslator {
        &self.translator
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.working_dir
    }

    /// Validate `config`, translate `command`, and run it past the policy.
    /// Returns the native command that would be executed. Dry runs stop
    /// here; real runs continue into [`execute`](Self::execute).
    pub fn prepare(
        &self,
        command: &str,
        config: &RetryConfig,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<String, ExecError> {
        config.validate()?;

        let native = self.translator.translate(command).into_owned();
        let decision = self.policy.validate(&native);
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "denied by policy".to_string());
            tracing::warn!(command = %native, %reason, "command denied");
            emitter.emit(&ExecEvent::CommandDenied(CommandDeniedEvent {
                command: native.clone(),
                reason: reason.clone(),
            }));
            return Err(ExecError::Denied {
                command: native,
                reason,
            });
        }
        Ok(native)
    }

    /// Execute `command`, retrying retryable failures per `retry`.
    ///
    /// `None` for `retry` runs exactly one attempt through the same path.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
        retry: Option<&RetryConfig>,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<CommandResult, ExecError> {
        let single = RetryConfig::single();
        let config = retry.unwrap_or(&single);
        let native = self.prepare(command, config, emitter)?;

        let invocation = CommandInvocation::new(
            self.translator.target(),
            native.clone(),
            self.working_dir.clone(),
        )
        .with_timeout(timeout)
        .with_capture_limit(self.capture_limit);

        let executor = self.executor.as_ref();
        let started = Instant::now();
        let outcome = run_with_retry(config, &native, emitter, |attempt| {
            let invocation = &invocation;
            let native = native.as_str();
            async move {
                tracing::trace!(attempt, command = native, "running command");
                match executor.execute(invocation).await {
                    Ok(output) if output.succeeded() => Ok(output),
                    Ok(output) => {
                        let category = classify_exit(
                            output.status.code(),
                            output.timed_out,
                            &output.stderr,
                            &output.stdout,
                        );
                        let message = failure_message(&output);
                        let exit_code = output.status.code();
                        Err(AttemptFailure::new(
                            CommandResult::from_output(command, native, output),
                            category,
                            message,
                        )
                        .with_exit_code(exit_code))
                    }
                    Err(err) => {
                        let category = launch_category(&err);
                        let message = format!("{err:#}");
                        Err(AttemptFailure::new(
                            CommandResult::launch_failure(command, native, message.clone()),
                            category,
                            message,
                        ))
                    }
                }
            }
        })
        .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(retried) => {
                let mut result = CommandResult::from_output(command, &native, retried.value);
                result.attempts = retried.attempts;
                result.elapsed = elapsed;
                Ok(result)
            }
            Err(failed) => {
                let mut result = failed.error;
                result.attempts = failed.attempts;
                result.elapsed = elapsed;
                Err(ExecError::Failed {
                    result: Box::new(result),
                    category: failed.category,
                    exhausted: failed.exhausted,
                })
            }
        }
    }
}

fn launch_category(err: &anyhow::Error) -> ErrorCategory {
    let missing_shell = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::NotFound);
    if missing_shell {
        ErrorCategory::CommandNotFound
    } else {
        classify_anyhow_error(err)
    }
}

fn failure_message(output: &CommandOutput) -> String {
    if output.timed_out {
        return "command timed out".to_string();
    }
    let detail = output.stderr.trim();
    let detail = if detail.is_empty() {
        output.stdout.trim()
    } else {
        detail
    };
    let code = output
        .status
        .code()
        .map_or_else(|| "signal".to_string(), |code| code.to_string());
    match detail.lines().next() {
        Some(first) => format!("exit {code}: {first}"),
        None => format!("exit {code}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ShellKind;
    use crate::policy::PatternPolicy;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use toolflow_exec_events::MemoryEmitter;

    /// FIFO of canned outputs; the last one repeats once the queue drains.
    struct Script {
        outputs: Mutex<VecDeque<CommandOutput>>,
        calls: Mutex<Vec<String>>,
    }

    impl Script {
        fn new(outputs: impl IntoIterator<Item = CommandOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, command: &str) -> CommandOutput {
            self.calls.lock().unwrap().push(command.to_string());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.len() > 1 {
                outputs.pop_front().unwrap()
            } else {
                outputs.front().cloned().unwrap()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CommandExecutor for Script {
        async fn execute(&self, invocation: &CommandInvocation) -> anyhow::Result<CommandOutput> {
            Ok(self.next(&invocation.command))
        }
    }

    fn executor_with(script: Arc<Script>) -> RetryExecutor {
        RetryExecutor::new(".")
            .with_translator(CommandTranslator::new(ShellKind::Unix))
            .with_executor(script)
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_then_succeed() {
        let script = Arc::new(Script::new([
            CommandOutput::failure(1, "HTTP 503 Service Unavailable"),
            CommandOutput::failure(1, "HTTP 503 Service Unavailable"),
            CommandOutput::success("payload"),
        ]));
        let mut events = MemoryEmitter::new();
        let retry = RetryConfig::new(3, Duration::from_millis(1000));

        let started = Instant::now();
        let result = executor_with(script.clone())
            .execute("curl https://api.example.com", None, Some(&retry), &mut events)
            .await
            .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(result.stdout, "payload");
        assert!(result.success());
        assert_eq!(script.call_count(), 3);
        // 1000ms then 2000ms, each within ±10%.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(2700), "{waited:?}");
        assert!(waited <= Duration::from_millis(3300), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failure_is_not_retried() {
        let script = Arc::new(Script::new([CommandOutput::failure(
            1,
            "error: 401 Unauthorized",
        )]));
        let mut events = MemoryEmitter::new();
        let retry = RetryConfig::new(5, Duration::from_millis(100));

        let err = executor_with(script.clone())
            .execute("curl https://api.example.com", None, Some(&retry), &mut events)
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 1);
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert!(matches!(err, ExecError::Failed { exhausted: false, .. }));
        assert_eq!(script.call_count(), 1);
        assert!(
            !events
                .events()
                .iter()
                .any(|event| matches!(event, ExecEvent::AttemptWaiting(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_last_result() {
        let script = Arc::new(Script::new([CommandOutput::timeout()]));
        let mut events = MemoryEmitter::new();
        let retry = RetryConfig::new(2, Duration::from_millis(50));

        let err = executor_with(script.clone())
            .execute("sleep 100", Some(Duration::from_millis(10)), Some(&retry), &mut events)
            .await
            .unwrap_err();

        let ExecError::Failed {
            result,
            category,
            exhausted,
        } = err
        else {
            panic!("expected failure");
        };
        assert!(exhausted);
        assert_eq!(category, ErrorCategory::Timeout);
        assert_eq!(result.attempts, 2);
        assert!(result.timed_out);
        assert!(matches!(
            events.events().last(),
            Some(ExecEvent::AttemptsExhausted(_))
        ));
    }

    #[tokio::test]
    async fn denied_commands_never_execute() {
        let script = Arc::new(Script::new([CommandOutput::success("")]));
        let policy = PatternPolicy::new([r"\brm\s+-rf\b"]).unwrap();
        let mut events = MemoryEmitter::new();

        let err = executor_with(script.clone())
            .with_policy(Arc::new(policy))
            .execute(
                "rm -rf build",
                None,
                Some(&RetryConfig::default()),
                &mut events,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Denied { .. }));
        assert_eq!(err.attempts(), 0);
        assert_eq!(script.call_count(), 0);
        assert!(matches!(
            events.events().as_slice(),
            [ExecEvent::CommandDenied(_)]
        ));
    }

    #[tokio::test]
    async fn invalid_retry_config_is_rejected_before_running() {
        let script = Arc::new(Script::new([CommandOutput::success("")]));
        let mut events = MemoryEmitter::new();
        let err = executor_with(script.clone())
            .execute(
                "ls",
                None,
                Some(&RetryConfig::new(0, Duration::ZERO)),
                &mut events,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Config(RetryConfigError::MaxAttempts(0))));
        assert_eq!(script.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_retry_block_runs_once() {
        let script = Arc::new(Script::new([CommandOutput::failure(1, "connection reset")]));
        let mut events = MemoryEmitter::new();
        let err = executor_with(script.clone())
            .execute("curl example.com", None, None, &mut events)
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(matches!(err, ExecError::Failed { exhausted: true, .. }));
    }

    #[test]
    fn failure_message_prefers_stderr_first_line() {
        let mut output = CommandOutput::failure(2, "boom\nmore detail");
        output.stdout = "ignored".into();
        assert_eq!(failure_message(&output), "exit 2: boom");
        assert_eq!(
            failure_message(&CommandOutput::timeout()),
            "command timed out"
        );
    }
}
