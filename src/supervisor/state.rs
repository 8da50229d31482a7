//! Job state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::artifacts::CommandRecord;
use crate::plugins::{PluginSet, StatusHandler, StatusUpdate};

/// Return code forced on jobs that timed out or were canceled.
pub const RC_TIMEOUT: i32 = 254;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Unstarted,
    Starting,
    Running,
    Successful,
    Failed,
    Timeout,
    Canceled,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
        }
    }

    /// Returns true once the job can no longer change state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Successful | Self::Failed | Self::Timeout | Self::Canceled
        )
    }

    /// Returns true while the child may still be producing events.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status string that names no known state.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unstarted" => Ok(Self::Unstarted),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "successful" => Ok(Self::Successful),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "canceled" => Ok(Self::Canceled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Final status and return code of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub rc: i32,
}

/// Termination triggers latched during the run loop.
///
/// Each flag only ever goes from false to true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobState {
    canceled: bool,
    timed_out: bool,
    errored: bool,
}

impl JobState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&mut self) {
        if !self.canceled {
            tracing::info!("Job canceled");
        }
        self.canceled = true;
    }

    pub fn time_out(&mut self) {
        if !self.timed_out {
            tracing::info!("Job timed out");
        }
        self.timed_out = true;
    }

    pub fn error(&mut self) {
        self.errored = true;
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// Returns true if the child should be forcibly terminated.
    #[must_use]
    pub fn should_terminate(&self) -> bool {
        self.canceled || self.timed_out || self.errored
    }

    /// Classify the child's return code into a terminal outcome.
    #[must_use]
    pub fn outcome(&self, rc: i32) -> JobOutcome {
        if self.canceled {
            JobOutcome {
                status: JobStatus::Canceled,
                rc: RC_TIMEOUT,
            }
        } else if self.timed_out {
            JobOutcome {
                status: JobStatus::Timeout,
                rc: RC_TIMEOUT,
            }
        } else if rc == 0 && !self.errored {
            JobOutcome {
                status: JobStatus::Successful,
                rc,
            }
        } else {
            JobOutcome {
                status: JobStatus::Failed,
                rc,
            }
        }
    }
}

/// Publishes status transitions to watchers, the status handler and plugins.
pub struct StatusNotifier {
    ident: String,
    tx: watch::Sender<JobStatus>,
    handler: Option<StatusHandler>,
    plugins: PluginSet,
}

impl fmt::Debug for StatusNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusNotifier")
            .field("ident", &self.ident)
            .field("status", &*self.tx.borrow())
            .field("handler", &self.handler.is_some())
            .field("plugins", &self.plugins)
            .finish()
    }
}

impl StatusNotifier {
    #[must_use]
    pub fn new(ident: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(JobStatus::Unstarted);
        Self {
            ident: ident.into(),
            tx,
            handler: None,
            plugins: PluginSet::new(),
        }
    }

    #[must_use]
    pub fn with_handler(mut self, handler: StatusHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginSet) -> Self {
        self.plugins = plugins;
        self
    }

    /// Watch the current status.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn current(&self) -> JobStatus {
        *self.tx.borrow()
    }

    /// Record a transition and deliver it to every listener.
    pub fn notify(&self, status: JobStatus, command: Option<CommandRecord>) {
        let previous = self.tx.send_replace(status);
        tracing::debug!(ident = %self.ident, from = %previous, to = %status, "Status transition");

        let update = StatusUpdate {
            status,
            runner_ident: self.ident.clone(),
            command,
        };
        if let Some(handler) = &self.handler {
            handler(&update);
        }
        self.plugins.dispatch_status(&update);
    }
}
