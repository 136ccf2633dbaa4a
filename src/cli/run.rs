use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use toolflow_core::{
    ApprovalGate, AutoApprove, AutoReject, EngineOptions, FlowDefinition, FlowEngine, FlowReport,
    ProviderKind, StepKind, StepOutcome, ToolflowConfig,
};
use toolflow_exec_events::{ExecEvent, FanoutEmitter, TracingEmitter, json as event_json};
use toolflow_llm::ChatProvider;
use toolflow_llm::providers::{OpenAIProvider, ScriptedProvider, ScriptedTurn};
use tracing::Level;

use crate::approval::ConsoleApproval;
use crate::startup::StartupContext;

use super::validate::handle_validate_command;

const MOCK_REPLY: &str = "(mock reply)";

#[derive(Debug, Clone, Default)]
pub struct RunCommandOptions {
    pub flow: PathBuf,
    pub dry_run: bool,
    pub auto_approve: bool,
    pub provider: Option<ProviderKind>,
    pub json: bool,
    pub events: bool,
}

/// Provider for a run. The mock provider answers each chat step once with a
/// fixed reply.
pub fn build_provider(
    config: &ToolflowConfig,
    kind: ProviderKind,
    flow: &FlowDefinition,
) -> Result<Arc<dyn ChatProvider>> {
    match kind {
        ProviderKind::Mock => {
            let provider = ScriptedProvider::new();
            flow.steps
                .iter()
                .filter(|step| matches!(step.kind, StepKind::Chat(_)))
                .for_each(|_| provider.enqueue(ScriptedTurn::text(MOCK_REPLY)));
            Ok(Arc::new(provider))
        }
        ProviderKind::OpenAI => {
            let Some(api_key) = config.provider.api_key() else {
                bail!(
                    "Set {} to use the openai provider",
                    config.provider.api_key_env
                );
            };
            Ok(Arc::new(OpenAIProvider::new(
                Some(api_key),
                config.provider.model.clone(),
                config.provider.base_url.clone(),
            )))
        }
    }
}

fn approval_gate(auto_approve: bool) -> Arc<dyn ApprovalGate> {
    if auto_approve {
        Arc::new(AutoApprove)
    } else if std::io::stdin().is_terminal() {
        Arc::new(ConsoleApproval)
    } else {
        tracing::warn!("stdin is not a terminal; approval steps will be rejected (use --yes)");
        Arc::new(AutoReject)
    }
}

/// What a Ctrl-C should do to a running flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// First interrupt: stop after the current step.
    Cancel,
    /// The flow was already cancelled; leave now.
    Exit,
}

pub fn handle_interrupt(cancel: &CancellationToken) -> InterruptAction {
    if cancel.is_cancelled() {
        InterruptAction::Exit
    } else {
        cancel.cancel();
        InterruptAction::Cancel
    }
}

pub async fn handle_run_command(
    startup: &StartupContext,
    options: &RunCommandOptions,
    cancel: &CancellationToken,
) -> Result<FlowReport> {
    let flow = handle_validate_command(startup, &options.flow)?;
    let config = &startup.config;
    let kind = options.provider.unwrap_or(config.provider.kind);
    let provider = build_provider(config, kind, &flow)?;

    let engine = FlowEngine::from_config(config, &startup.workspace, provider)?
        .with_approvals(approval_gate(options.auto_approve))
        .with_options(EngineOptions::from_config(config).with_dry_run(options.dry_run));

    let mut emitter = FanoutEmitter::new().with(TracingEmitter::new(Level::DEBUG));
    if options.events {
        emitter = emitter.with(|event: &ExecEvent| match event_json::versioned_to_string(event) {
            Ok(line) => eprintln!("{line}"),
            Err(err) => tracing::warn!(error = %err, "failed to serialize event"),
        });
    }

    let report = engine.run(&flow, cancel, &mut emitter).await?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        print!("{}", render_report(&report));
    }
    Ok(report)
}

fn report_json(report: &FlowReport) -> serde_json::Value {
    json!({
        "runId": report.run_id,
        "state": report.state.as_str(),
        "visits": report.visits,
        "context": report.context,
        "error": report.error.as_ref().map(|failed| json!({
            "index": failed.index,
            "category": failed.error.category(),
            "message": failed.error.to_string(),
        })),
    })
}

fn render_report(report: &FlowReport) -> String {
    let mut out = format!("run {}: {}\n", report.run_id, report.state.as_str());
    for visit in &report.visits {
        let label = match &visit.id {
            Some(id) => format!("[{}] {} ({id})", visit.index, visit.kind),
            None => format!("[{}] {}", visit.index, visit.kind),
        };
        let line = match &visit.outcome {
            StepOutcome::Completed => format!("  {label}: ok\n"),
            StepOutcome::DryRun { action } => format!("  {label}: would {action}\n"),
            StepOutcome::Continued { category, message } => {
                format!("  {label}: failed ({category}), continuing: {message}\n")
            }
            StepOutcome::Failed { category, message } => {
                let mut line = format!("  {label}: failed ({category}): {message}\n");
                for hint in category.recovery_suggestions() {
                    line.push_str("    hint: ");
                    line.push_str(&hint);
                    line.push('\n');
                }
                line
            }
            StepOutcome::Rejected { message } => format!("  {label}: rejected: {message}\n"),
        };
        out.push_str(&line);
    }
    out
}
