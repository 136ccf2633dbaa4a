//! Flow state machine.
//!
//! A run moves `Pending -> Running(i) -> {Completed | Failed | Aborted}`.
//! Steps execute strictly in order; each step's handler sees the context
//! left by earlier steps. Cancellation is observed between steps only, so
//! an in-flight command or model turn always finishes first.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use toolflow_bash_runner::{
    AttemptFailure, CommandResult, CommandTranslator, PatternPolicy, RetryConfig, RetryExecutor,
    run_with_retry,
};
use toolflow_commons::{ErrorCategory, classify_anyhow_error};
use toolflow_exec_events::{
    EventEmitter, ExecEvent, FlowFinishedEvent, FlowInvalidEvent, FlowStartedEvent,
    StepCompletedEvent, StepEvent, StepFailedEvent,
};
use toolflow_llm::{ChatOptions, ChatProvider, Message, run_turn};
use uuid::Uuid;

use crate::config::{RetryDefaults, ToolflowConfig};
use crate::context::{FlowContext, StepFailure};
use crate::error::{FlowError, StepError};
use crate::flow::{
    ApprovalStep, ChatStep, FlowDefinition, FlowStep, ReadFileStep, RetryBlock, SHELL_TOOL,
    StepKind, ToolCallStep,
};
use crate::handlers::{
    ApprovalGate, ApprovalRequest, AutoReject, FileReader, ReadFileTool, ShellTool, ToolRegistry,
    WorkspaceFileReader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Pending,
    Running { step: usize },
    Completed,
    Failed,
    Aborted,
}

impl FlowState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running { step } => write!(f, "running(step {step})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    /// Dry run; carries what the step would have done.
    DryRun { action: String },
    /// Failed, recorded in the context, flow continued.
    Continued {
        category: ErrorCategory,
        message: String,
    },
    Failed {
        category: ErrorCategory,
        message: String,
    },
    Rejected { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepVisit {
    pub index: usize,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub outcome: StepOutcome,
}

#[derive(Debug)]
pub struct FailedStep {
    pub index: usize,
    pub error: StepError,
}

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct FlowReport {
    pub run_id: String,
    pub state: FlowState,
    pub visits: Vec<StepVisit>,
    pub context: FlowContext,
    /// The error that ended the run in `Failed` or, for rejections, `Aborted`.
    pub error: Option<FailedStep>,
}

impl FlowReport {
    /// Indices of the steps the run dispatched, in order.
    pub fn visited(&self) -> Vec<usize> {
        self.visits.iter().map(|visit| visit.index).collect()
    }

    pub fn succeeded(&self) -> bool {
        self.state == FlowState::Completed
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub dry_run: bool,
    pub chat: ChatOptions,
    pub retry_defaults: RetryDefaults,
    pub read_max_bytes: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&ToolflowConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &ToolflowConfig) -> Self {
        Self {
            dry_run: false,
            chat: ChatOptions {
                model: config.provider.model.clone(),
                ..ChatOptions::default()
            },
            retry_defaults: config.retry.clone(),
            read_max_bytes: config.read_file.max_bytes,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

pub struct FlowEngine {
    provider: Arc<dyn ChatProvider>,
    shell: ShellTool,
    tools: ToolRegistry,
    files: Arc<dyn FileReader>,
    approvals: Arc<dyn ApprovalGate>,
    options: EngineOptions,
}

impl FlowEngine {
    /// Approvals are rejected until a gate is configured.
    pub fn new(provider: Arc<dyn ChatProvider>, shell: ShellTool, files: Arc<dyn FileReader>) -> Self {
        Self {
            provider,
            shell,
            tools: ToolRegistry::new(),
            files,
            approvals: Arc::new(AutoReject),
            options: EngineOptions::default(),
        }
    }

    /// Engine wired from configuration: host translator (or the configured
    /// shell), deny-pattern policy, workspace-scoped file reader, and the
    /// built-in `read_file` tool.
    pub fn from_config(
        config: &ToolflowConfig,
        workspace: &Path,
        provider: Arc<dyn ChatProvider>,
    ) -> Result<Self> {
        let policy = PatternPolicy::new(&config.policy.deny_patterns)
            .context("invalid policy.deny_patterns")?;
        let executor = RetryExecutor::new(workspace)
            .with_translator(CommandTranslator::new(config.execution.shell()))
            .with_policy(Arc::new(policy))
            .with_capture_limit(config.execution.max_output_bytes);
        let shell = ShellTool::new(executor)
            .with_retry_defaults(config.retry.clone())
            .with_default_timeout(config.execution.default_timeout());
        let files: Arc<dyn FileReader> = Arc::new(WorkspaceFileReader::new(workspace));
        let tools =
            ToolRegistry::new().with(Arc::new(ReadFileTool::new(files.clone(), config.read_file.max_bytes)));

        Ok(Self::new(provider, shell, files)
            .with_tools(tools)
            .with_options(EngineOptions::from_config(config)))
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalGate>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn run(
        &self,
        flow: &FlowDefinition,
        cancel: &CancellationToken,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<FlowReport, FlowError> {
        self.run_with_context(flow, FlowContext::new(), cancel, emitter)
            .await
    }

    /// Run `flow` starting from a pre-populated context.
    pub async fn run_with_context(
        &self,
        flow: &FlowDefinition,
        mut context: FlowContext,
        cancel: &CancellationToken,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<FlowReport, FlowError> {
        if let Err(err) = flow.validate(&self.options.retry_defaults) {
            tracing::warn!(steps = flow.len(), error = %err, "flow rejected before start");
            emitter.emit(&ExecEvent::FlowInvalid(FlowInvalidEvent {
                step_count: flow.len(),
                message: err.to_string(),
            }));
            return Err(err.into());
        }

        let run_id = Uuid::new_v4().to_string();
        let dry_run = self.options.dry_run;
        let mut state = FlowState::Pending;
        let mut visits = Vec::with_capacity(flow.len());
        let mut error = None;

        tracing::info!(%run_id, steps = flow.len(), dry_run, "flow started");
        emitter.emit(&ExecEvent::FlowStarted(FlowStartedEvent {
            run_id: run_id.clone(),
            step_count: flow.len(),
            dry_run,
        }));

        for (index, step) in flow.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(%run_id, index, "flow cancelled before step");
                state = FlowState::Aborted;
                break;
            }
            state = FlowState::Running { step: index };
            tracing::debug!(%run_id, index, kind = step.kind_name(), "step started");

            let step_event = StepEvent {
                index,
                kind: step.kind_name().to_string(),
                step_id: step.id.clone(),
            };
            emitter.emit(&ExecEvent::StepStarted(step_event.clone()));

            let key = step.key(index);
            match self.dispatch(index, step, &mut context, &mut *emitter).await {
                Ok(action) => {
                    if let Some(action) = &action {
                        context.set(key, json!({ "dryRun": action }));
                    }
                    emitter.emit(&ExecEvent::StepCompleted(StepCompletedEvent {
                        step: step_event,
                        dry_run: action.clone(),
                    }));
                    visits.push(visit(index, step, match action {
                        Some(action) => StepOutcome::DryRun { action },
                        None => StepOutcome::Completed,
                    }));
                }
                Err(step_error) => {
                    let category = step_error.category();
                    let message = step_error.to_string();
                    let continued = step.continue_on_failure() && !step_error.is_rejection();
                    emitter.emit(&ExecEvent::StepFailed(StepFailedEvent {
                        step: step_event,
                        category,
                        message: message.clone(),
                        continued,
                    }));

                    if continued {
                        tracing::warn!(%run_id, index, %category, %message, "step failed, continuing");
                        context.record_failure(StepFailure {
                            index,
                            key,
                            kind: step.kind_name().to_string(),
                            category,
                            message: message.clone(),
                            attempts: step_error.attempts(),
                        });
                        visits.push(visit(index, step, StepOutcome::Continued { category, message }));
                        continue;
                    }

                    if step_error.is_rejection() {
                        tracing::info!(%run_id, index, "approval rejected, aborting flow");
                        visits.push(visit(index, step, StepOutcome::Rejected { message }));
                        state = FlowState::Aborted;
                    } else {
                        tracing::warn!(%run_id, index, %category, %message, "step failed");
                        visits.push(visit(index, step, StepOutcome::Failed { category, message }));
                        state = FlowState::Failed;
                    }
                    error = Some(FailedStep {
                        index,
                        error: step_error,
                    });
                    break;
                }
            }
        }

        if !state.is_terminal() {
            state = FlowState::Completed;
        }
        tracing::info!(%run_id, %state, visited = visits.len(), "flow finished");
        emitter.emit(&ExecEvent::FlowFinished(FlowFinishedEvent {
            run_id: run_id.clone(),
            state: state.as_str().to_string(),
            steps_visited: visits.len(),
        }));

        Ok(FlowReport {
            run_id,
            state,
            visits,
            context,
            error,
        })
    }

    /// Run one step. `Ok(Some(action))` is a dry-run description.
    async fn dispatch(
        &self,
        index: usize,
        step: &FlowStep,
        context: &mut FlowContext,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<Option<String>, StepError> {
        let key = step.key(index);
        let retry = step.retry.as_ref();
        match &step.kind {
            StepKind::Chat(chat) => self.chat(&key, chat, retry, context, emitter).await,
            StepKind::ToolCall(call) => self.tool_call(&key, call, retry, context, emitter).await,
            StepKind::ReadFile(read) => self.read_file(&key, read, retry, context, emitter).await,
            StepKind::Approval(approval) => self.approval(index, step, approval, context).await,
        }
    }

    fn retry_config(&self, retry: Option<&RetryBlock>) -> Result<RetryConfig, StepError> {
        let config = retry.map_or_else(RetryConfig::single, |block| {
            block.to_retry_config(&self.options.retry_defaults)
        });
        config.validate()?;
        Ok(config)
    }

    async fn chat(
        &self,
        key: &str,
        chat: &ChatStep,
        retry: Option<&RetryBlock>,
        context: &mut FlowContext,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<Option<String>, StepError> {
        let prompt = context.interpolate(&chat.prompt).into_owned();
        let mut messages = Vec::with_capacity(context.messages().len() + 2);
        if let Some(system) = &chat.system {
            messages.push(Message::system(context.interpolate(system)));
        }
        messages.extend(context.messages().iter().cloned());
        messages.push(Message::user(prompt.clone()));

        let config = self.retry_config(retry)?;
        if self.options.dry_run {
            return Ok(Some(format!(
                "send {} message(s) to {}",
                messages.len(),
                self.provider.name()
            )));
        }

        let provider = self.provider.as_ref();
        let options = &self.options.chat;
        let request = messages.as_slice();
        let outcome = run_with_retry(&config, "chat", emitter, move |_attempt| async move {
            // Each attempt gets its own token; flow cancellation waits for the turn.
            let token = CancellationToken::new();
            run_turn(provider, request, options, &token)
                .await
                .map_err(|err| {
                    let category = err.category();
                    let message = err.to_string();
                    AttemptFailure::new(err, category, message)
                })
        })
        .await;

        let retried = outcome.map_err(|failed| StepError::Chat {
            source: failed.error,
            attempts: failed.attempts,
        })?;
        let turn = retried.value;
        let invalid: Vec<String> = turn
            .invalid_tool_calls
            .iter()
            .map(ToString::to_string)
            .collect();
        context.set(
            key,
            json!({
                "text": turn.text,
                "toolCalls": turn.tool_calls,
                "invalidToolCalls": invalid,
                "attempts": retried.attempts,
            }),
        );
        context.push_message(Message::user(prompt));
        let mut reply = Message::assistant(turn.text);
        reply.tool_calls = turn.tool_calls;
        context.push_message(reply);
        Ok(None)
    }

    async fn tool_call(
        &self,
        key: &str,
        call: &ToolCallStep,
        retry: Option<&RetryBlock>,
        context: &mut FlowContext,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<Option<String>, StepError> {
        let args = context.interpolate_value(&call.args);

        if call.tool == SHELL_TOOL {
            if self.options.dry_run {
                return self.shell.dry_run(&args, retry, emitter).map(Some);
            }
            let result = self.shell.run(&args, retry, emitter).await?;
            context.set(key, command_value(&result));
            return Ok(None);
        }

        let tool = self
            .tools
            .get(&call.tool)
            .ok_or_else(|| StepError::UnknownTool(call.tool.clone()))?;
        let config = self.retry_config(retry)?;
        if self.options.dry_run {
            return Ok(Some(tool.describe(&args)));
        }

        let handler = tool.as_ref();
        let request = &args;
        let outcome = run_with_retry(&config, &call.tool, emitter, move |_attempt| async move {
            handler.call(request).await.map_err(|err| {
                let category = classify_anyhow_error(&err);
                let message = format!("{err:#}");
                AttemptFailure::new(err, category, message)
            })
        })
        .await;

        match outcome {
            Ok(retried) => {
                context.set(key, retried.value);
                Ok(None)
            }
            Err(failed) => Err(StepError::Tool {
                tool: call.tool.clone(),
                attempts: failed.attempts,
                category: failed.category,
                error: failed.error,
            }),
        }
    }

    async fn read_file(
        &self,
        key: &str,
        read: &ReadFileStep,
        retry: Option<&RetryBlock>,
        context: &mut FlowContext,
        emitter: &mut (dyn EventEmitter + Send),
    ) -> Result<Option<String>, StepError> {
        let path = context.interpolate(&read.path).into_owned();
        let max_bytes = read.max_bytes.unwrap_or(self.options.read_max_bytes);
        let config = self.retry_config(retry)?;
        if self.options.dry_run {
            return Ok(Some(format!("read up to {max_bytes} bytes from {path}")));
        }

        let files = self.files.as_ref();
        let target = path.as_str();
        let outcome = run_with_retry(&config, "read_file", emitter, move |_attempt| async move {
            files.read(target, max_bytes).await.map_err(|err| {
                let category = err.category();
                let message = err.to_string();
                AttemptFailure::new(err, category, message)
            })
        })
        .await;

        let retried = outcome.map_err(|failed| StepError::Read {
            source: failed.error,
            attempts: failed.attempts,
        })?;
        context.set(key, json!(retried.value));
        Ok(None)
    }

    async fn approval(
        &self,
        index: usize,
        step: &FlowStep,
        approval: &ApprovalStep,
        context: &mut FlowContext,
    ) -> Result<Option<String>, StepError> {
        let message = context.interpolate(&approval.message).into_owned();
        if self.options.dry_run {
            return Ok(Some(format!("ask for approval: {message}")));
        }

        let request = ApprovalRequest {
            index,
            step_id: step.id.clone(),
            message,
        };
        match self.approvals.decide(&request).await {
            Ok(true) => {
                context.set(step.key(index), json!({ "approved": true }));
                Ok(None)
            }
            Ok(false) => Err(StepError::Rejected {
                message: request.message,
            }),
            Err(err) => Err(StepError::Approval(err)),
        }
    }
}

fn visit(index: usize, step: &FlowStep, outcome: StepOutcome) -> StepVisit {
    StepVisit {
        index,
        kind: step.kind_name().to_string(),
        id: step.id.clone(),
        outcome,
    }
}

fn command_value(result: &CommandResult) -> Value {
    json!({
        "command": result.command,
        "nativeCommand": result.native_command,
        "exitCode": result.exit_code,
        "stdout": result.stdout,
        "stderr": result.stderr,
        "elapsedMs": u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
        "attempts": result.attempts,
        "timedOut": result.timed_out,
        "truncated": result.truncated,
    })
}
