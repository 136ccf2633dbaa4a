use std::sync::Arc;

use anyhow::{Context, Result};
use toolflow_bash_runner::{CommandTranslator, PatternPolicy, RetryConfig, RetryExecutor, ShellKind};
use toolflow_exec_events::NoopEmitter;

use crate::startup::StartupContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateOutcome {
    pub shell: ShellKind,
    pub native: String,
    /// Set when the configured policy denies the command.
    pub denied: Option<String>,
}

/// Translate `words` (joined with spaces) and run the result past the
/// configured policy, the same path a `shell_exec` step takes.
pub fn handle_translate_command(
    startup: &StartupContext,
    shell: Option<ShellKind>,
    words: &[String],
) -> Result<TranslateOutcome> {
    let shell = shell.unwrap_or_else(|| startup.config.execution.shell());
    let policy = PatternPolicy::new(&startup.config.policy.deny_patterns)
        .context("invalid policy.deny_patterns")?;
    let executor = RetryExecutor::new(&startup.workspace)
        .with_translator(CommandTranslator::new(shell))
        .with_policy(Arc::new(policy));

    let command = words.join(" ");
    let native = executor.translator().translate(&command).into_owned();
    let denied = match executor.prepare(&command, &RetryConfig::single(), &mut NoopEmitter) {
        Ok(_) => None,
        Err(err) => Some(err.to_string()),
    };
    Ok(TranslateOutcome {
        shell,
        native,
        denied,
    })
}
