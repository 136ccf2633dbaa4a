//! toolflow - run declarative tool flows from the terminal.
//!
//! Thin binary entry point that delegates to the handlers in `toolflow::cli`.

use anyhow::{Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use toolflow::cli::args::{Cli, Commands};
use toolflow::cli::{
    InterruptAction, RunCommandOptions, handle_interrupt, handle_run_command,
    handle_translate_command, handle_validate_command,
};
use toolflow::startup::StartupContext;

mod main_helpers;

/// Conventional exit status for termination by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let startup = StartupContext::load(&args.workspace, args.config.as_deref())?;
    main_helpers::initialize_tracing(&startup.config.debug);
    for layer in &startup.layers {
        tracing::debug!(path = %layer.path().display(), "configuration layer");
    }

    match &args.command {
        Commands::Run {
            flow,
            dry_run,
            yes,
            provider,
            json,
            events,
        } => {
            let options = RunCommandOptions {
                flow: flow.clone(),
                dry_run: *dry_run,
                auto_approve: *yes,
                provider: provider.map(Into::into),
                json: *json,
                events: *events,
            };

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    match handle_interrupt(&on_interrupt) {
                        InterruptAction::Cancel => tracing::warn!(
                            "interrupt received; stopping after the current step (Ctrl-C again exits)"
                        ),
                        InterruptAction::Exit => {
                            eprintln!("second interrupt; exiting");
                            std::process::exit(INTERRUPTED_EXIT_CODE);
                        }
                    }
                }
            });

            let report = handle_run_command(&startup, &options, &cancel).await?;
            if !report.succeeded() {
                match &report.error {
                    Some(failed) => bail!("flow {} at step {}: {}", report.state, failed.index, failed.error),
                    None => bail!("flow {}", report.state),
                }
            }
        }
        Commands::Validate { flow } => {
            let definition = handle_validate_command(&startup, flow)?;
            println!("{}: {} step(s) ok", flow.display(), definition.len());
        }
        Commands::Translate { shell, command } => {
            let outcome = handle_translate_command(&startup, shell.map(Into::into), command)?;
            println!("{}", outcome.native);
            if let Some(reason) = outcome.denied {
                bail!("{reason}");
            }
        }
    }

    Ok(())
}
