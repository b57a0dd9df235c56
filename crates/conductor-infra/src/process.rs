//! Child-process execution shared by the process-backed executors.
//!
//! Every child is spawned with `kill_on_drop`, so abandoning the wait (on
//! timeout or cancellation) terminates the process. On unix the child also
//! leads its own process group, and the whole group is killed, so
//! background jobs started by a shell command go down with it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Added to the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Run `command` through the platform shell.
    pub fn shell(command: impl Into<String>) -> Self {
        let (program, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("sh", "-c") };
        Self {
            program: program.to_string(),
            args: vec![flag.to_string(), command.into()],
            ..Self::default()
        }
    }

    pub fn program(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    /// Short human-readable form for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("process timed out after {0}ms")]
    Timeout(u64),

    #[error("process cancelled")]
    Cancelled,
}

/// Spawn `spec`, feed `stdin`, and wait for it to exit.
///
/// The wait is raced against `timeout` and `cancel`; whichever fires first
/// kills the child.
pub async fn run(
    spec: &CommandSpec,
    stdin: Option<String>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    #[cfg(unix)]
    command.process_group(0);

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        command: spec.display(),
        source,
    })?;
    tracing::debug!(command = %spec.display(), pid = ?child.id(), "spawned process");
    let mut group = ProcessGroupGuard::new(child.id());

    // Written from a separate task so a child that fills its stdout pipe
    // before reading stdin cannot deadlock the wait below.
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                tracing::debug!(error = %e, "child closed stdin early");
            }
        });
    }

    let wait = child.wait_with_output();
    let output = match timeout {
        Some(limit) => tokio::select! {
            result = tokio::time::timeout(limit, wait) => match result {
                Ok(output) => output?,
                Err(_) => return Err(ProcessError::Timeout(limit.as_millis() as u64)),
            },
            () = cancel.cancelled() => return Err(ProcessError::Cancelled),
        },
        None => tokio::select! {
            output = wait => output?,
            () = cancel.cancelled() => return Err(ProcessError::Cancelled),
        },
    };
    group.disarm();

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Kills the child's process group when dropped before the child exited.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    #[cfg(unix)]
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take().and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return;
        };
        // SAFETY: killpg takes plain integers and touches no memory.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pgid, error = %err, "failed to kill process group");
            }
        }
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {
        self.pgid = None;
    }
}
