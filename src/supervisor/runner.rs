//! Supervisor run loop.
//!
//! Drives one child from `starting` to a terminal state. In interactive mode
//! the child runs on a pty and its output is streamed into the scanner as it
//! arrives while prompts, cancellation and both timeouts are polled once per
//! iteration. In subprocess mode the child runs on pipes and its output is
//! collected in bulk under a single hard timeout.

use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::artifacts::{create_private, ArtifactDir, ArtifactError, CommandRecord};
use crate::config::{ContainerConfig, ExpectPrompt, RunnerMode};
use crate::events::{EventCounter, EventSink, StreamEventScanner};
use crate::plugins::{CancelCallback, PluginError};
use crate::supervisor::{
    exit_code, kill_container, spawn_reader, JobOutcome, JobProcess, JobState, JobStatus,
    PromptMatcher, PtyProcess, SpawnError, StatusNotifier, Utf8Decoder, RC_NOT_FOUND, RC_TIMEOUT,
};

/// Default bound on each wait for output.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Minimum time spent draining output after the child has exited.
pub const FINAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Buffered pty reads between the reader thread and the run loop.
const CHANNEL_BUFFER: usize = 64;

type Scanner = StreamEventScanner<Arc<dyn EventSink>>;

/// Error type for supervisor operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// A caller-supplied callback failed.
    #[error("Exception in {0} callback: {1}")]
    Callback(&'static str, PluginError),
    /// A prompt pattern did not compile.
    #[error("Invalid prompt pattern: {0}")]
    InvalidPrompt(#[from] regex::Error),
    /// Artifacts could not be written.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// Process state could not be queried.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one job child to completion.
pub struct ProcessSupervisor {
    command: CommandRecord,
    artifacts: ArtifactDir,
    sink: Arc<dyn EventSink>,
    notifier: StatusNotifier,
    idle_timeout: Option<Duration>,
    job_timeout: Option<Duration>,
    subprocess_timeout: Option<Duration>,
    poll_interval: Duration,
    prompts: Vec<ExpectPrompt>,
    container: Option<ContainerConfig>,
    echo: bool,
    output_files: bool,
    json_mode: bool,
    cancel: Option<CancelCallback>,
    state: JobState,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("command", &self.command.command)
            .field("artifacts", &self.artifacts)
            .field("idle_timeout", &self.idle_timeout)
            .field("job_timeout", &self.job_timeout)
            .field("subprocess_timeout", &self.subprocess_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("container", &self.container)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(
        command: CommandRecord,
        artifacts: ArtifactDir,
        sink: Arc<dyn EventSink>,
        notifier: StatusNotifier,
    ) -> Self {
        Self {
            command,
            artifacts,
            sink,
            notifier,
            idle_timeout: None,
            job_timeout: None,
            subprocess_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            prompts: Vec::new(),
            container: None,
            echo: false,
            output_files: true,
            json_mode: false,
            cancel: None,
            state: JobState::new(),
        }
    }

    /// Kill the job after this long without output.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Kill the job after this much total runtime.
    #[must_use]
    pub fn job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Hard limit for subprocess mode.
    #[must_use]
    pub fn subprocess_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.subprocess_timeout = timeout;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn prompts(mut self, prompts: Vec<ExpectPrompt>) -> Self {
        self.prompts = prompts;
        self
    }

    #[must_use]
    pub fn container(mut self, container: Option<ContainerConfig>) -> Self {
        self.container = container;
        self
    }

    /// Echo output to this process's stdout.
    #[must_use]
    pub fn echo(mut self, enabled: bool) -> Self {
        self.echo = enabled;
        self
    }

    /// Write the `stdout`/`stderr` artifacts.
    #[must_use]
    pub fn output_files(mut self, enabled: bool) -> Self {
        self.output_files = enabled;
        self
    }

    #[must_use]
    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    #[must_use]
    pub fn cancel_callback(mut self, callback: CancelCallback) -> Self {
        self.cancel = Some(callback);
        self
    }

    /// Run the job and write its `status` and `rc` artifacts.
    ///
    /// Ordinary failure, timeout and cancellation are reported through the
    /// returned outcome, as is a command that cannot be started.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::Callback` if the cancel callback fails, or an
    /// error if artifacts cannot be written or the child cannot be polled.
    pub async fn run(&mut self, mode: RunnerMode) -> Result<JobOutcome, SupervisorError> {
        self.notifier
            .notify(JobStatus::Starting, Some(self.command.clone()));
        self.artifacts.prepare()?;
        self.artifacts.write_command(&self.command)?;

        let outcome = match mode {
            RunnerMode::Interactive => self.run_interactive().await?,
            RunnerMode::Subprocess => self.run_subprocess().await?,
        };
        self.finish(outcome)
    }

    async fn run_interactive(&mut self) -> Result<JobOutcome, SupervisorError> {
        let mut scanner = self.scanner(self.artifacts.stdout_path(), EventCounter::new())?;
        if self.output_files {
            let path = self.artifacts.stderr_path();
            create_private(&path).map_err(|source| ArtifactError::Write { path, source })?;
        }
        let mut prompts = PromptMatcher::new(&self.prompts)?;

        self.notifier.notify(JobStatus::Running, None);
        let (tx, mut rx) = mpsc::channel(CHANNEL_BUFFER);
        let started = PtyProcess::spawn(&self.command)
            .and_then(|process| process.spawn_reader(tx).map(|()| process));
        let mut process = match started {
            Ok(process) => process,
            Err(e) => return Ok(self.spawn_failed(&e, vec![scanner])),
        };
        scanner.set_pid(process.id());
        let mut decoder = Utf8Decoder::new();

        let job_start = Instant::now();
        let mut last_output = Instant::now();
        let mut output_open = true;
        let mut terminated = false;

        let rc = loop {
            if let Some(rc) = process.try_wait()? {
                break rc;
            }

            if output_open {
                match tokio::time::timeout(self.poll_interval, rx.recv()).await {
                    Ok(Some(bytes)) => {
                        last_output = Instant::now();
                        let text = decoder.decode(&bytes);
                        scanner.write(&text);
                        if let Some(response) = prompts.feed(&text) {
                            process.send_line(response);
                            last_output = Instant::now();
                        }
                    }
                    Ok(None) => output_open = false,
                    Err(_) => {}
                }
            } else {
                let _ = tokio::time::timeout(self.poll_interval, process.wait()).await;
            }

            if scanner.has_failed() {
                self.state.error();
            }

            if !self.state.is_canceled() {
                match self.cancel.as_mut().map(|cancel| cancel()) {
                    Some(Ok(true)) => self.state.cancel(),
                    Some(Ok(false)) | None => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Cancel callback failed");
                        self.terminate(&mut process).await;
                        let rc = process.wait().await.unwrap_or(-1);
                        scanner.close();
                        self.state.error();
                        let outcome = self.state.outcome(rc);
                        self.finish(outcome)?;
                        return Err(SupervisorError::Callback("cancel", e));
                    }
                }
            }

            if let Some(limit) = self.job_timeout {
                if !self.state.is_canceled() && job_start.elapsed() > limit {
                    self.state.time_out();
                }
            }

            if self.state.should_terminate() && !terminated {
                self.terminate(&mut process).await;
                terminated = true;
            }

            if let Some(idle) = self.idle_timeout {
                if !terminated && last_output.elapsed() > idle {
                    tracing::warn!(idle_secs = idle.as_secs_f64(), "No output within idle timeout");
                    self.state.time_out();
                    self.terminate(&mut process).await;
                    terminated = true;
                }
            }
        };

        // Output written just before exit may still be in the pty.
        let deadline = Instant::now() + self.drain_timeout();
        while output_open {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(bytes)) => scanner.write(&decoder.decode(&bytes)),
                Ok(None) => output_open = false,
                Err(_) => {
                    tracing::debug!("Pty still open after exit, abandoning reader");
                    break;
                }
            }
        }
        drop(rx);
        let tail = decoder.finish();
        if !tail.is_empty() {
            scanner.write(&tail);
        }

        self.close_scanners(vec![scanner]);
        Ok(self.state.outcome(rc))
    }

    async fn run_subprocess(&mut self) -> Result<JobOutcome, SupervisorError> {
        let counter = EventCounter::new();
        let mut stdout = self.scanner(self.artifacts.stdout_path(), counter.clone())?;
        let mut stderr = self.scanner(self.artifacts.stderr_path(), counter)?;

        self.notifier.notify(JobStatus::Running, None);
        let mut process = match JobProcess::spawn(&self.command) {
            Ok(process) => process,
            Err(e) => return Ok(self.spawn_failed(&e, vec![stdout, stderr])),
        };
        let pid = process.id();
        stdout.set_pid(pid);
        stderr.set_pid(pid);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let readers: Vec<_> = [
            process.take_stdout().map(|pipe| spawn_reader(pipe, out_tx)),
            process.take_stderr().map(|pipe| spawn_reader(pipe, err_tx)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let waited = match self.subprocess_timeout {
            Some(limit) => tokio::time::timeout(limit, process.wait()).await.ok(),
            None => Some(process.wait().await),
        };

        let mut wait_error = None;
        let rc = match waited {
            Some(Ok(status)) => exit_code(status),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Subprocess wait failed");
                self.state.error();
                self.terminate_subprocess(&mut process).await;
                wait_error = Some(e);
                -1
            }
            None => {
                tracing::warn!("Subprocess timed out");
                self.state.time_out();
                self.terminate_subprocess(&mut process).await;
                RC_TIMEOUT
            }
        };

        // Whatever was read before a timeout or kill still belongs in the artifacts.
        let deadline = Instant::now() + self.drain_timeout();
        let (out, err) = tokio::join!(
            drain_pipe(&mut out_rx, deadline),
            drain_pipe(&mut err_rx, deadline)
        );
        for reader in readers {
            reader.abort();
        }
        stdout.write(&String::from_utf8_lossy(&out));
        stderr.write(&String::from_utf8_lossy(&err));
        if let Some(e) = wait_error {
            stderr.write(&format!("{e}\n"));
        }

        self.close_scanners(vec![stdout, stderr]);
        Ok(self.state.outcome(rc))
    }

    /// Build a scanner writing to `path` unless output files are suppressed.
    fn scanner(&self, path: PathBuf, counter: EventCounter) -> Result<Scanner, SupervisorError> {
        let mut scanner =
            StreamEventScanner::with_counter(Arc::clone(&self.sink), counter).json_mode(self.json_mode);
        if self.output_files {
            let file = create_private(&path).map_err(|source| ArtifactError::Write { path, source })?;
            scanner = scanner.with_log(Box::new(BufWriter::new(file)));
        }
        if self.echo {
            scanner = scanner.with_console(Box::new(std::io::stdout()));
        }
        Ok(scanner)
    }

    /// Record a spawn failure as one verbose event and a `failed` outcome.
    fn spawn_failed(&mut self, err: &SpawnError, mut scanners: Vec<Scanner>) -> JobOutcome {
        tracing::error!(command = ?self.command.command, error = %err, "Failed to start job");
        if let Some(first) = scanners.first_mut() {
            first.write(&format!("{err}\n"));
        }
        self.close_scanners(scanners);
        self.state.outcome(RC_NOT_FOUND)
    }

    fn close_scanners(&mut self, scanners: Vec<Scanner>) {
        for mut scanner in scanners {
            scanner.close();
            if let Some(e) = scanner.take_failure() {
                tracing::error!(error = %e, "Event persistence failed");
                self.state.error();
            }
        }
    }

    fn drain_timeout(&self) -> Duration {
        self.poll_interval.max(FINAL_DRAIN_TIMEOUT)
    }

    async fn terminate(&self, process: &mut PtyProcess) {
        if let Some(container) = &self.container {
            kill_container(container).await;
        }
        process.kill_group();
    }

    async fn terminate_subprocess(&self, process: &mut JobProcess) {
        if let Some(container) = &self.container {
            kill_container(container).await;
        }
        process.kill_group();
    }

    fn finish(&mut self, outcome: JobOutcome) -> Result<JobOutcome, SupervisorError> {
        self.notifier.notify(outcome.status, None);
        self.artifacts.write_outcome(outcome.status, outcome.rc)?;
        tracing::info!(status = %outcome.status, rc = outcome.rc, "Job finished");
        Ok(outcome)
    }
}

/// Collect everything a pipe reader forwards until it closes or `deadline`.
async fn drain_pipe(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, deadline: Instant) -> Vec<u8> {
    let mut bytes = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(chunk)) => bytes.extend(chunk),
            Ok(None) => break,
            Err(_) => {
                tracing::debug!("Pipe still open after exit, keeping what was read");
                while let Ok(chunk) = rx.try_recv() {
                    bytes.extend(chunk);
                }
                break;
            }
        }
    }
    bytes
}
