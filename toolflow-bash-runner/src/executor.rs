use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Default per-stream capture limit.
pub const DEFAULT_CAPTURE_LIMIT: usize = 256 * 1024;

/// How long reader tasks get to drain after the process group has been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Shell family used to execute commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Unix,
    Windows,
}

impl ShellKind {
    /// Shell family of the machine this binary runs on.
    pub const fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Windows => "windows",
        }
    }
}

/// Describes a command that will be executed by a [`CommandExecutor`].
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub shell: ShellKind,
    /// Native (already translated) command text.
    pub command: String,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub capture_limit: usize,
}

impl CommandInvocation {
    pub fn new(shell: ShellKind, command: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            shell,
            command: command.into(),
            working_dir,
            timeout: None,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }
}

/// Describes the exit status of a command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    success: bool,
    code: Option<i32>,
}

impl CommandStatus {
    pub fn new(success: bool, code: Option<i32>) -> Self {
        Self { success, code }
    }

    pub fn exited(code: i32) -> Self {
        Self::new(code == 0, Some(code))
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }
}

impl From<std::process::ExitStatus> for CommandStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

/// Output produced by the executor for a command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Set when either stream exceeded the capture limit.
    pub truncated: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::exited(0),
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
            truncated: false,
            duration: Duration::ZERO,
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::exited(code),
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
            truncated: false,
            duration: Duration::ZERO,
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: CommandStatus::new(false, None),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
            truncated: false,
            duration: Duration::ZERO,
        }
    }

    /// A run counts as successful only when the process exited zero on its own.
    pub fn succeeded(&self) -> bool {
        self.status.success() && !self.timed_out
    }
}

/// Trait implemented by concrete command execution strategies.
///
/// `Err` is reserved for failures to launch the process at all; a process
/// that ran and failed is reported through [`CommandOutput::status`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: &CommandInvocation) -> Result<CommandOutput>;
}

/// Executes commands by delegating to the system shell via [`tokio::process`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl ProcessCommandExecutor {
    pub fn new() -> Self {
        Self
    }

    fn build(invocation: &CommandInvocation) -> Command {
        let mut command = match invocation.shell {
            ShellKind::Unix => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(&invocation.command);
                command
            }
            ShellKind::Windows => {
                let mut command = Command::new("powershell");
                command
                    .arg("-NoProfile")
                    .arg("-NonInteractive")
                    .arg("-Command")
                    .arg(&invocation.command);
                command
            }
        };
        command
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout can take down grandchildren too.
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, invocation: &CommandInvocation) -> Result<CommandOutput> {
        let start = Instant::now();
        let mut child = Self::build(invocation).spawn().with_context(|| {
            format!(
                "failed to spawn {} shell for `{}`",
                invocation.shell.as_str(),
                invocation.command
            )
        })?;

        let limit = invocation.capture_limit;
        let mut stdout_task = tokio::spawn(read_capped(child.stdout.take(), limit));
        let mut stderr_task = tokio::spawn(read_capped(child.stderr.take(), limit));

        // Captured up front: `Child::id` is gone once the child is reaped.
        let pgid = child.id();
        let deadline = invocation.timeout.map(|limit| start + limit);

        let waited = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };
        let (mut status, mut timed_out) = match waited {
            Some(status) => (CommandStatus::from(status?), false),
            None => {
                tracing::debug!(command = %invocation.command, timeout = ?invocation.timeout, "command timed out, killing");
                kill_tree(&mut child, pgid).await?;
                (CommandStatus::new(false, None), true)
            }
        };

        // The same deadline bounds the pipes: a background job started by
        // the shell can hold them open after the shell itself exits.
        let drain_deadline = if timed_out {
            Some(Instant::now() + DRAIN_GRACE)
        } else {
            deadline
        };
        let mut stdout = drain_until(&mut stdout_task, drain_deadline).await?;
        let mut stderr = drain_until(&mut stderr_task, drain_deadline).await?;
        if !timed_out && (stdout.is_none() || stderr.is_none()) {
            tracing::debug!(command = %invocation.command, "output still open at deadline, killing process group");
            kill_group(pgid);
            status = CommandStatus::new(false, None);
            timed_out = true;
            let grace = Some(Instant::now() + DRAIN_GRACE);
            if stdout.is_none() {
                stdout = drain_until(&mut stdout_task, grace).await?;
            }
            if stderr.is_none() {
                stderr = drain_until(&mut stderr_task, grace).await?;
            }
        }
        let (stdout, stdout_truncated) = stdout.unwrap_or_else(|| {
            stdout_task.abort();
            (Vec::new(), false)
        });
        let (stderr, stderr_truncated) = stderr.unwrap_or_else(|| {
            stderr_task.abort();
            (Vec::new(), false)
        });

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
            truncated: stdout_truncated || stderr_truncated,
            duration: start.elapsed(),
        })
    }
}

/// SIGKILL the whole process group the shell leads. No-op off unix.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid.and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            tracing::debug!(%err, pgid, "killpg failed");
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

async fn kill_tree(child: &mut Child, pgid: Option<u32>) -> Result<()> {
    kill_group(pgid);
    child.kill().await.or_else(|err| {
        // Already reaped by the group kill.
        if err.kind() == std::io::ErrorKind::InvalidInput {
            Ok(())
        } else {
            Err(err)
        }
    })?;
    Ok(())
}

type ReadResult = std::io::Result<(Vec<u8>, bool)>;

/// Join a reader task, giving up at `deadline`. `None` means the pipe was
/// still open; the handle has not completed and may be awaited again.
async fn drain_until(
    task: &mut tokio::task::JoinHandle<ReadResult>,
    deadline: Option<Instant>,
) -> Result<Option<(Vec<u8>, bool)>> {
    let joined = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, &mut *task).await {
            Ok(joined) => joined,
            Err(_) => return Ok(None),
        },
        None => task.await,
    };
    Ok(Some(joined.context("output reader panicked")??))
}

/// Reads a stream to EOF, keeping at most `max_bytes`. The remainder is
/// discarded so the child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, max_bytes: usize) -> ReadResult
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };

    let mut output = Vec::new();
    let mut truncated = false;
    let mut buffer = [0u8; 4096];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let remaining = max_bytes.saturating_sub(output.len());
        if remaining < read {
            truncated = true;
        }
        if remaining > 0 {
            output.extend_from_slice(&buffer[..remaining.min(read)]);
        }
    }
    Ok((output, truncated))
}
