//! Interactive children on a pseudo-terminal.
//!
//! The child becomes the leader of a new session with the pty slave as its
//! controlling terminal, so prompts written to `/dev/tty` reach the run loop
//! and a process-group kill reaches everything it started. Echo and
//! newline translation are switched off before the child starts.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize,
};
use tokio::sync::mpsc::Sender;

use crate::artifacts::CommandRecord;
use crate::supervisor::{kill_process_group, SpawnError, READ_CHUNK_SIZE};

const PTY_SIZE: PtySize = PtySize {
    rows: 24,
    cols: 80,
    pixel_width: 0,
    pixel_height: 0,
};

/// How often `wait` re-checks a child that has not exited yet.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// A job child attached to a pty.
pub struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("writable", &self.writer.is_some())
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Start `command` on a fresh pty.
    ///
    /// The child inherits this process's environment overlaid with
    /// `command.env`, and runs in `command.cwd` or the current directory.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the pty cannot be opened or the child fails
    /// to start.
    pub fn spawn(command: &CommandRecord) -> Result<Self, SpawnError> {
        let (program, args) = command
            .command
            .split_first()
            .ok_or(SpawnError::EmptyCommand)?;
        let start_error = |reason: String| SpawnError::Terminal {
            program: program.clone(),
            reason,
        };

        let mut builder = CommandBuilder::new(program);
        builder.args(args);
        for (key, value) in &command.env {
            builder.env(key, value);
        }
        let cwd = match &command.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        builder.cwd(cwd);

        let PtyPair { master, slave } = native_pty_system()
            .openpty(PTY_SIZE)
            .map_err(|e| start_error(e.to_string()))?;
        #[cfg(unix)]
        if let Some(tty) = master.tty_name() {
            disable_echo(&tty);
        }
        let child = slave
            .spawn_command(builder)
            .map_err(|e| start_error(e.to_string()))?;
        // The master only sees EOF once no descriptor of the slave is left here.
        drop(slave);

        let writer = match master.take_writer() {
            Ok(writer) => Some(writer),
            Err(e) => {
                tracing::warn!(error = %e, "Child stdin unavailable, prompts will not be answered");
                None
            }
        };
        let pid = child.process_id();
        tracing::debug!(program = %program, pid, "Spawned job on pty");

        Ok(Self {
            child,
            master,
            writer,
            pid,
        })
    }

    /// Pid recorded at spawn time, also valid after the child is reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Forward terminal output into `tx` from a dedicated thread until the
    /// pty closes or the receiver goes away.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the pty cannot be read or the thread cannot
    /// be started.
    pub fn spawn_reader(&self, tx: Sender<Vec<u8>>) -> Result<(), SpawnError> {
        let mut reader = self
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::Terminal {
                program: "pty reader".to_string(),
                reason: e.to_string(),
            })?;
        std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        // Linux reports EIO once the last slave descriptor closes.
                        Err(e) => {
                            tracing::trace!(error = %e, "Pty read finished");
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Type `line` followed by a newline into the terminal.
    ///
    /// A failed write closes the input side for the rest of the run.
    pub fn send_line(&mut self, line: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = writer
            .write_all(format!("{line}\n").as_bytes())
            .and_then(|()| writer.flush());
        if let Err(e) = result {
            tracing::debug!(error = %e, "Failed to answer prompt, closing input");
            self.writer = None;
        }
    }

    /// Return code if the child has exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| i32::try_from(status.exit_code()).unwrap_or(-1)))
    }

    /// Wait for the child to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        loop {
            if let Some(rc) = self.try_wait()? {
                return Ok(rc);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// SIGKILL the child's whole session group.
    pub fn kill_group(&mut self) {
        match self.pid {
            Some(pid) => kill_process_group(pid),
            None => {
                if let Err(e) = self.child.kill() {
                    tracing::debug!(error = %e, "Child already gone");
                }
            }
        }
    }
}

/// Turn off echo and output newline translation on the slave side.
#[cfg(unix)]
fn disable_echo(tty: &std::path::Path) {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, OutputFlags, SetArg};
    use std::os::unix::fs::OpenOptionsExt;

    let result = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(nix::libc::O_NOCTTY)
        .open(tty)
        .and_then(|file| {
            let mut attrs = tcgetattr(&file)?;
            attrs.local_flags.remove(LocalFlags::ECHO);
            attrs.output_flags.remove(OutputFlags::ONLCR);
            tcsetattr(&file, SetArg::TCSANOW, &attrs)?;
            Ok(())
        });
    if let Err(e) = result {
        tracing::warn!(tty = %tty.display(), error = %e, "Could not configure terminal");
    }
}
