use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use toolflow_bash_runner::ShellKind;
use toolflow_core::ProviderKind;

#[derive(Debug, Parser)]
#[command(name = "toolflow")]
#[command(about = "Run declarative tool flows: model turns, shell commands, file reads, approvals")]
#[command(version)]
pub struct Cli {
    /// Workspace root; relative paths in flows resolve against it
    #[arg(short, long, global = true, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file, replacing the user and workspace layers
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a flow file (JSON, or TOML by extension)
    Run {
        flow: PathBuf,

        /// Report what each step would do without running anything
        #[arg(long)]
        dry_run: bool,

        /// Approve every approval step without prompting
        #[arg(short, long)]
        yes: bool,

        /// Override the configured provider
        #[arg(long, value_enum)]
        provider: Option<ProviderArg>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,

        /// Stream execution events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Parse and check a flow file without running it
    Validate { flow: PathBuf },
    /// Show the host-shell form of a portable command and the policy verdict
    Translate {
        /// Target dialect; defaults to the configured or host shell
        #[arg(long, value_enum)]
        shell: Option<ShellArg>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderArg {
    Mock,
    Openai,
}

impl From<ProviderArg> for ProviderKind {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Mock => Self::Mock,
            ProviderArg::Openai => Self::OpenAI,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShellArg {
    Unix,
    Windows,
}

impl From<ShellArg> for ShellKind {
    fn from(value: ShellArg) -> Self {
        match value {
            ShellArg::Unix => Self::Unix,
            ShellArg::Windows => Self::Windows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn translate_keeps_hyphenated_words() {
        let cli = Cli::parse_from(["toolflow", "translate", "--shell", "windows", "head", "-n", "5", "log.txt"]);
        match cli.command {
            Commands::Translate { shell, command } => {
                assert_eq!(shell, Some(ShellArg::Windows));
                assert_eq!(command, vec!["head", "-n", "5", "log.txt"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
