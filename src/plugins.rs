//! Caller-supplied hooks invoked while a job runs.
//!
//! Plugins are a fixed, ordered set registered before the job starts. Each
//! one sees every persisted event and every status transition; a failing
//! plugin is logged and skipped so it can never abort the job.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::artifacts::CommandRecord;
use crate::events::Event;
use crate::supervisor::{JobOutcome, JobStatus};

/// Error type returned by caller-supplied hooks.
pub type PluginError = Box<dyn std::error::Error + Send + Sync>;

/// Decides whether an event is written to disk. Returning `false` vetoes it.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Receives every status transition.
pub type StatusHandler = Arc<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Polled once per supervisor iteration; `Ok(true)` cancels the job.
pub type CancelCallback = Box<dyn FnMut() -> Result<bool, PluginError> + Send>;

/// Invoked once after the final artifacts are written.
pub type FinishedCallback = Box<dyn FnOnce(&JobOutcome) -> Result<(), PluginError> + Send>;

/// A status transition as seen by handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub runner_ident: String,
    /// Present on the `starting` transition only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandRecord>,
}

/// An external event and status consumer.
pub trait RunnerPlugin: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called for every event that reaches the persister.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller and otherwise ignored.
    fn event_handler(&self, event: &Event) -> Result<(), PluginError>;

    /// Called for every status transition.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller and otherwise ignored.
    fn status_handler(&self, update: &StatusUpdate) -> Result<(), PluginError> {
        let _ = update;
        Ok(())
    }
}

/// Ordered collection of registered plugins.
#[derive(Clone, Default)]
pub struct PluginSet {
    plugins: Vec<Arc<dyn RunnerPlugin>>,
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

impl PluginSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: Arc<dyn RunnerPlugin>) {
        self.plugins.push(plugin);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Deliver an event to every plugin in registration order.
    pub fn dispatch_event(&self, event: &Event) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.event_handler(event) {
                tracing::warn!(
                    plugin = plugin.name(),
                    uuid = %event.uuid,
                    error = %e,
                    "Plugin event handler failed"
                );
            }
        }
    }

    /// Deliver a status update to every plugin in registration order.
    pub fn dispatch_status(&self, update: &StatusUpdate) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.status_handler(update) {
                tracing::warn!(
                    plugin = plugin.name(),
                    status = %update.status,
                    error = %e,
                    "Plugin status handler failed"
                );
            }
        }
    }
}

/// Adapt a cancellation token into a cancel callback.
#[must_use]
pub fn cancel_on_token(token: CancellationToken) -> CancelCallback {
    Box::new(move || Ok(token.is_cancelled()))
}
