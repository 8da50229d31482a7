//! Composition root: wires configuration, persistence, plugins and the
//! supervisor together for one job.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::{JobHandle, RunnerError};
use crate::artifacts::{ArtifactDir, CommandRecord};
use crate::config::{RunnerConfig, OMIT_EVENTS_ENV, ONLY_FAILED_EVENTS_ENV};
use crate::events::{EventPersister, ISOLATED_DATA_DIR_ENV};
use crate::plugins::{
    CancelCallback, EventFilter, FinishedCallback, PluginSet, RunnerPlugin, StatusHandler,
};
use crate::supervisor::{JobOutcome, ProcessSupervisor, StatusNotifier, SupervisorError};

/// Runs one job described by a [`RunnerConfig`].
pub struct Runner {
    config: RunnerConfig,
    ident: String,
    artifacts: ArtifactDir,
    notifier: StatusNotifier,
    plugins: PluginSet,
    filter: Option<EventFilter>,
    cancel: Option<CancelCallback>,
    finished: Option<FinishedCallback>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("ident", &self.ident)
            .field("artifacts", &self.artifacts)
            .field("mode", &self.config.mode)
            .field("plugins", &self.plugins)
            .field("filter", &self.filter.is_some())
            .field("cancel", &self.cancel.is_some())
            .field("finished", &self.finished.is_some())
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Validate `config` and resolve the job's identity and artifact directory.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Config` if the configuration is unusable.
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerError> {
        config.validate()?;
        let ident = config
            .ident
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let artifacts = ArtifactDir::new(config.artifact_dir.join(&ident));
        let notifier = StatusNotifier::new(ident.clone());

        Ok(Self {
            config,
            ident,
            artifacts,
            notifier,
            plugins: PluginSet::new(),
            filter: None,
            cancel: None,
            finished: None,
        })
    }

    /// Register a plugin. Plugins are called in registration order.
    #[must_use]
    pub fn with_plugin(mut self, plugin: Arc<dyn RunnerPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Veto persistence of individual events.
    #[must_use]
    pub fn with_event_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_status_handler(mut self, handler: StatusHandler) -> Self {
        self.notifier = self.notifier.with_handler(handler);
        self
    }

    #[must_use]
    pub fn with_cancel_callback(mut self, cancel: CancelCallback) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn with_finished_callback(mut self, finished: FinishedCallback) -> Self {
        self.finished = Some(finished);
        self
    }

    #[must_use]
    pub fn ident(&self) -> &str {
        &self.ident
    }

    #[must_use]
    pub fn artifact_dir(&self) -> &Path {
        self.artifacts.root()
    }

    /// A handle that observes this job while it runs and after it finishes.
    #[must_use]
    pub fn handle(&self) -> JobHandle {
        JobHandle::new(
            self.ident.clone(),
            self.artifacts.clone(),
            self.notifier.subscribe(),
        )
    }

    /// Run the job to a terminal state.
    ///
    /// Ordinary failure, timeout and cancellation are reported through the
    /// returned outcome.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Supervisor` wrapping a callback error if the
    /// cancel or finished callback fails, or an error if the artifact
    /// directory cannot be prepared.
    pub async fn run(self) -> Result<JobOutcome, RunnerError> {
        self.artifacts.prepare()?;
        if self.config.ident.is_some() && self.config.rotate_artifacts > 0 {
            if let Err(e) = self.artifacts.rotate(self.config.rotate_artifacts) {
                tracing::warn!(error = %e, "Artifact rotation failed");
            }
        }

        let command = CommandRecord {
            command: self.config.command.clone(),
            cwd: self.config.cwd.clone(),
            env: self.child_env(),
        };

        let mut persister = EventPersister::new(self.artifacts.root(), self.ident.clone())
            .with_remove_partials(self.config.remove_partials)
            .with_missing_partial(self.config.missing_partial)
            .with_data_policy(self.config.data_policy())
            .with_plugins(self.plugins.clone());
        if let Some(filter) = self.filter {
            persister = persister.with_filter(filter);
        }
        let notifier = self.notifier.with_plugins(self.plugins);

        let mut supervisor =
            ProcessSupervisor::new(command, self.artifacts, Arc::new(persister), notifier)
                .idle_timeout(self.config.idle_timeout())
                .job_timeout(self.config.job_timeout())
                .subprocess_timeout(self.config.subprocess_timeout())
                .poll_interval(self.config.poll_interval())
                .prompts(self.config.expect_passwords.clone())
                .container(self.config.container.clone())
                .echo(!self.config.suppress_output)
                .output_files(!self.config.suppress_output_file)
                .json_mode(self.config.json_mode);
        if let Some(cancel) = self.cancel {
            supervisor = supervisor.cancel_callback(cancel);
        }

        tracing::info!(ident = %self.ident, mode = ?self.config.mode, "Starting job");
        let outcome = supervisor.run(self.config.mode).await?;

        if let Some(finished) = self.finished {
            finished(&outcome).map_err(|e| SupervisorError::Callback("finished", e))?;
        }
        Ok(outcome)
    }

    /// Overlay for the child environment.
    ///
    /// Exports the event data toggles and points the partial-record writer at
    /// this job's artifact directory.
    fn child_env(&self) -> BTreeMap<String, String> {
        let root = self.artifacts.root();
        let data_dir = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

        let mut env = self.config.env.clone();
        env.insert(
            OMIT_EVENTS_ENV.to_string(),
            self.config.omit_event_data.to_string(),
        );
        env.insert(
            ONLY_FAILED_EVENTS_ENV.to_string(),
            self.config.only_failed_event_data.to_string(),
        );
        env.insert(
            ISOLATED_DATA_DIR_ENV.to_string(),
            data_dir.display().to_string(),
        );
        env
    }
}
