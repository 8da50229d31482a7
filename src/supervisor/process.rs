//! Child process spawning and forced termination.
//!
//! Children are started in their own process group so a forced kill reaches
//! every grandchild as well.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::artifacts::CommandRecord;
use crate::config::ContainerConfig;

/// Return code reported when the executable could not be started.
pub const RC_NOT_FOUND: i32 = 127;

/// Size of each read from a child pipe or pty.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Upper bound on one `<engine> kill <name>` invocation.
pub const CONTAINER_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The argv list was empty.
    #[error("No command to run")]
    EmptyCommand,
    /// The executable was not found.
    #[error("The command was not found or was not executable: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// The pty could not be set up or the child failed to start on it.
    #[error("Failed to start {program}: {reason}")]
    Terminal { program: String, reason: String },
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: std::io::Error, program: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(program.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(program.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Return code of an exited child; death by signal `n` maps to `-n`.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// A job child on plain pipes.
#[derive(Debug)]
pub struct JobProcess {
    child: Child,
    pid: Option<u32>,
}

impl JobProcess {
    /// Spawn `command` with stdout and stderr piped and stdin closed.
    ///
    /// The child inherits this process's environment overlaid with
    /// `command.env`.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(command: &CommandRecord) -> Result<Self, SpawnError> {
        let (program, args) = command
            .command
            .split_first()
            .ok_or(SpawnError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(ref dir) = command.cwd {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(e, program))?;
        let pid = child.id();
        tracing::debug!(program = %program, pid, "Spawned job process");

        Ok(Self { child, pid })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Pid recorded at spawn time, also valid after the child is reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGKILL the whole process group. Failures are ignored.
    pub fn kill_group(&mut self) {
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Child already gone");
        }
    }
}

/// SIGKILL the process group led by `pid`. Failures are ignored.
pub fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pid, "Killed process group"),
            Err(e) => tracing::debug!(pid, error = %e, "Process group kill failed"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Ask the container engine to kill the job's container.
///
/// The engine's exit status is logged, never propagated. An engine that does
/// not answer within [`CONTAINER_KILL_TIMEOUT`] is abandoned.
pub async fn kill_container(container: &ContainerConfig) {
    kill_container_within(container, CONTAINER_KILL_TIMEOUT).await;
}

async fn kill_container_within(container: &ContainerConfig, limit: Duration) {
    let invocation = Command::new(&container.executable)
        .args(["kill", &container.name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(limit, invocation).await {
        Ok(Ok(output)) if output.status.success() => {
            tracing::info!(container = %container.name, "Killed container");
        }
        Ok(Ok(output)) => tracing::warn!(
            container = %container.name,
            rc = exit_code(output.status),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Container kill failed"
        ),
        Ok(Err(e)) => tracing::warn!(
            container = %container.name,
            executable = %container.executable,
            error = %e,
            "Failed to run container kill"
        ),
        Err(_) => tracing::warn!(
            container = %container.name,
            timeout_secs = limit.as_secs_f64(),
            "Container engine did not answer kill in time"
        ),
    }
}

/// Forward everything read from `reader` into `tx` until EOF.
pub fn spawn_reader<R>(mut reader: R, tx: UnboundedSender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Pipe read failed");
                    break;
                }
            }
        }
    })
}
