//! Command handlers behind the `toolflow` binary.

pub mod args;
mod run;
mod translate;
mod validate;

pub use run::{
    InterruptAction, RunCommandOptions, build_provider, handle_interrupt, handle_run_command,
};
pub use translate::{TranslateOutcome, handle_translate_command};
pub use validate::handle_validate_command;
