//! Configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::events::{EventDataPolicy, MissingPartialPolicy, DEFAULT_MAX_EVENT_RES};

/// Toggles `event_data` omission for every event.
pub const OMIT_EVENTS_ENV: &str = "RUNNER_OMIT_EVENTS";

/// Toggles `event_data` retention for failure events only.
pub const ONLY_FAILED_EVENTS_ENV: &str = "RUNNER_ONLY_FAILED_EVENTS";

/// How the child is driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    /// Streamed output, prompt answering, idle and job timeouts.
    #[default]
    Interactive,
    /// Bulk capture with a single hard timeout.
    Subprocess,
}

/// A prompt pattern and the line written back when it appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectPrompt {
    /// Regular expression matched against recent output.
    pub pattern: String,
    /// Sent to the child's stdin, followed by a newline.
    pub response: String,
}

/// Container engine used to kill a containerized job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Engine executable, e.g. `podman` or `docker`.
    #[serde(default = "default_container_executable")]
    pub executable: String,
    /// Name of the job's container.
    pub name: String,
}

fn default_container_executable() -> String {
    "podman".to_string()
}

/// Settings for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Job identifier; a fresh uuid when unset.
    pub ident: Option<String>,
    /// Base directory; each job writes to `<artifact_dir>/<ident>`.
    pub artifact_dir: PathBuf,
    /// Fully formed argv of the child.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Variables overlaid on the inherited environment.
    pub env: BTreeMap<String, String>,
    pub mode: RunnerMode,
    /// Seconds without output before the job is killed.
    pub idle_timeout: Option<f64>,
    /// Seconds of total runtime before the job is killed.
    pub job_timeout: Option<f64>,
    /// Hard limit in subprocess mode, in seconds.
    pub subprocess_timeout: Option<f64>,
    /// Upper bound on each wait for output.
    pub poll_interval_ms: u64,
    pub expect_passwords: Vec<ExpectPrompt>,
    /// Do not echo output to the console.
    pub suppress_output: bool,
    /// Do not write the `stdout`/`stderr` artifacts.
    pub suppress_output_file: bool,
    /// Write marker events to the stdout log and console as JSON lines.
    pub json_mode: bool,
    pub omit_event_data: bool,
    pub only_failed_event_data: bool,
    pub max_event_res: usize,
    pub missing_partial: MissingPartialPolicy,
    pub remove_partials: bool,
    /// Sibling artifact directories to keep; 0 disables rotation.
    pub rotate_artifacts: usize,
    pub container: Option<ContainerConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ident: None,
            artifact_dir: PathBuf::from("artifacts"),
            command: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            mode: RunnerMode::default(),
            idle_timeout: None,
            job_timeout: None,
            subprocess_timeout: None,
            poll_interval_ms: 250,
            expect_passwords: Vec::new(),
            suppress_output: false,
            suppress_output_file: false,
            json_mode: false,
            omit_event_data: false,
            only_failed_event_data: false,
            max_event_res: DEFAULT_MAX_EVENT_RES,
            missing_partial: MissingPartialPolicy::default(),
            remove_partials: true,
            rotate_artifacts: 0,
            container: None,
        }
    }
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

fn env_flag(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

impl RunnerConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        seconds(self.idle_timeout)
    }

    #[must_use]
    pub fn job_timeout(&self) -> Option<Duration> {
        seconds(self.job_timeout)
    }

    #[must_use]
    pub fn subprocess_timeout(&self) -> Option<Duration> {
        seconds(self.subprocess_timeout)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn data_policy(&self) -> EventDataPolicy {
        EventDataPolicy {
            omit: self.omit_event_data,
            only_failed: self.only_failed_event_data,
            max_res: self.max_event_res,
        }
    }

    /// Apply `RUNNER_OMIT_EVENTS` and `RUNNER_ONLY_FAILED_EVENTS` from the
    /// process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(OMIT_EVENTS_ENV) {
            self.omit_event_data = env_flag(&value);
        }
        if let Some(value) = lookup(ONLY_FAILED_EVENTS_ENV) {
            self.only_failed_event_data = env_flag(&value);
        }
    }

    /// Check values that cannot be rejected by deserialization alone.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EmptyCommand` or `ConfigError::InvalidValue`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        for (field, value) in [
            ("idle_timeout", self.idle_timeout),
            ("job_timeout", self.job_timeout),
            ("subprocess_timeout", self.subprocess_timeout),
        ] {
            if let Some(secs) = value {
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(ConfigError::InvalidValue {
                        field,
                        reason: format!("{secs} is not a positive number of seconds"),
                    });
                }
            }
        }
        if let Some(container) = &self.container {
            if container.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "container.name",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}
