//! Cross-platform command runner. A portable, POSIX-flavored command is
//! translated into the host shell dialect, checked against a
//! [`CommandPolicy`], and executed through a trait-based
//! [`CommandExecutor`] so callers can swap the process strategy (system
//! shell, scripted fakes in tests) while reusing the retry loop.

pub mod executor;
pub mod policy;
pub mod retry;
pub mod runner;
pub mod translate;

pub use executor::{
    CommandExecutor, CommandInvocation, CommandOutput, CommandStatus, ProcessCommandExecutor,
    ShellKind,
};
pub use policy::{AllowAllPolicy, CommandPolicy, PatternPolicy, PolicyDecision};
pub use retry::{AttemptFailure, RetryConfig, RetryConfigError, RetryError, Retried, run_with_retry};
pub use runner::{CommandResult, ExecError, RetryExecutor};
pub use translate::CommandTranslator;
