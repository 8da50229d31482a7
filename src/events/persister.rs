//! Merges the two halves of each event and commits it to disk.
//!
//! The scanner hands over the stream half (uuid, text, counter, line
//! offsets). The plugin may already have staged a partial record for the
//! same uuid, or may never do so; both cases are expected. The merged record
//! is written to `<counter>-<uuid>.json` through a temp file and a rename, so
//! a reader either sees the complete file or nothing.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::EventError;
use super::partial::PartialEventStore;
use super::types::{Event, STATS_EVENT, VERBOSE_EVENT};
use crate::artifacts::{write_atomic, JOB_EVENTS_DIR};
use crate::plugins::{EventFilter, PluginSet};

/// Default cap on the serialized size of `event_data.res`.
pub const DEFAULT_MAX_EVENT_RES: usize = 700_000;

/// Replacement text for results flagged `no_log`.
pub const CENSORED: &str =
    "the output has been hidden due to the fact that 'no_log: true' was specified for this result";

/// Receiver of events produced by a scanner.
pub trait EventSink: Send + Sync {
    /// Accept one event.
    ///
    /// # Errors
    ///
    /// Returns an error only when the job should be failed because of it.
    fn on_event(&self, event: Event) -> Result<(), EventError>;
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn on_event(&self, event: Event) -> Result<(), EventError> {
        (**self).on_event(event)
    }
}

/// What to do when no partial record exists for an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPartialPolicy {
    /// Persist the stream half alone.
    #[default]
    Ignore,
    /// Skip persisting that one event.
    DropEvent,
    /// Fail the whole job.
    FailJob,
}

/// Controls how much `event_data` reaches disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDataPolicy {
    /// Drop `event_data` from every event.
    pub omit: bool,
    /// Keep `event_data` only for failure events.
    pub only_failed: bool,
    /// Replace `res` with `{}` when its JSON exceeds this many bytes.
    pub max_res: usize,
}

impl Default for EventDataPolicy {
    fn default() -> Self {
        Self {
            omit: false,
            only_failed: false,
            max_res: DEFAULT_MAX_EVENT_RES,
        }
    }
}

impl EventDataPolicy {
    /// Strip, cap and redact `event_data` in place.
    pub fn apply(&self, event: &mut Event) {
        if self.omit || (self.only_failed && !event.is_failure()) {
            event.event_data = None;
            return;
        }
        let is_stats = event.event == STATS_EVENT;
        let Some(data) = event.event_data.as_mut() else {
            return;
        };
        redact_no_log(data);
        if is_stats {
            return;
        }
        if let Some(res) = data.get_mut("res") {
            if res.to_string().len() > self.max_res {
                *res = Value::Object(Map::new());
            }
        }
    }
}

/// Censor results that the automation tool flagged as `no_log`.
pub fn redact_no_log(event_data: &mut Value) {
    fn flagged(value: &Value) -> bool {
        value.get("_ansible_no_log").and_then(Value::as_bool) == Some(true)
    }

    let Some(res) = event_data.get_mut("res") else {
        return;
    };
    if flagged(res) {
        *res = json!({ "censored": CENSORED });
        return;
    }
    if let Some(results) = res.get_mut("results").and_then(Value::as_array_mut) {
        for item in results.iter_mut().filter(|item| flagged(item)) {
            *item = json!({ "censored": CENSORED });
        }
    }
}

/// `U` for a rewritten duplicate uuid `U_<n>`.
#[must_use]
pub fn base_uuid(uuid: &str) -> Option<&str> {
    let (base, suffix) = uuid.rsplit_once('_')?;
    let n: u32 = suffix.parse().ok()?;
    (n >= 2 && !base.is_empty()).then_some(base)
}

/// Commits merged events to the events directory.
pub struct EventPersister {
    events_dir: PathBuf,
    partials: PartialEventStore,
    ident: String,
    remove_partials: bool,
    missing_partial: MissingPartialPolicy,
    data_policy: EventDataPolicy,
    filter: Option<EventFilter>,
    plugins: PluginSet,
}

impl std::fmt::Debug for EventPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPersister")
            .field("events_dir", &self.events_dir)
            .field("ident", &self.ident)
            .field("remove_partials", &self.remove_partials)
            .field("missing_partial", &self.missing_partial)
            .field("data_policy", &self.data_policy)
            .field("filter", &self.filter.is_some())
            .field("plugins", &self.plugins)
            .finish()
    }
}

impl EventPersister {
    /// Persister writing under `<artifact_dir>/job_events`.
    #[must_use]
    pub fn new(artifact_dir: impl AsRef<Path>, ident: impl Into<String>) -> Self {
        let artifact_dir = artifact_dir.as_ref();
        Self {
            events_dir: artifact_dir.join(JOB_EVENTS_DIR),
            partials: PartialEventStore::new(artifact_dir),
            ident: ident.into(),
            remove_partials: true,
            missing_partial: MissingPartialPolicy::default(),
            data_policy: EventDataPolicy::default(),
            filter: None,
            plugins: PluginSet::new(),
        }
    }

    #[must_use]
    pub fn with_remove_partials(mut self, remove: bool) -> Self {
        self.remove_partials = remove;
        self
    }

    #[must_use]
    pub fn with_missing_partial(mut self, policy: MissingPartialPolicy) -> Self {
        self.missing_partial = policy;
        self
    }

    #[must_use]
    pub fn with_data_policy(mut self, policy: EventDataPolicy) -> Self {
        self.data_policy = policy;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginSet) -> Self {
        self.plugins = plugins;
        self
    }

    #[must_use]
    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    /// Final path of an event record.
    #[must_use]
    pub fn event_path(&self, event: &Event) -> PathBuf {
        self.events_dir
            .join(format!("{}-{}.json", event.counter, event.uuid))
    }

    /// Merge, filter and write one event.
    ///
    /// Returns the written path, or `None` when the event was not written
    /// (sentinel, vetoed, dropped, or a write failure that was logged).
    ///
    /// # Errors
    ///
    /// Returns `EventError::MissingPartial` under `MissingPartialPolicy::FailJob`,
    /// or an error if a staged partial record cannot be read.
    pub fn persist(&self, mut event: Event) -> Result<Option<PathBuf>, EventError> {
        if event.is_eof() || event.uuid.is_empty() {
            tracing::trace!(event = %event.event, "Skipping event without uuid");
            return Ok(None);
        }

        let scanner_verbose = event.is_verbose();
        event
            .extra
            .insert("runner_ident".to_string(), Value::String(self.ident.clone()));

        match self.take_partial(&event.uuid)? {
            Some(partial) => event.merge_partial(partial),
            None if scanner_verbose => {}
            None => {
                let path = self.partials.path_for(&event.uuid);
                match self.missing_partial {
                    MissingPartialPolicy::Ignore => {
                        tracing::debug!(uuid = %event.uuid, path = %path.display(), "No partial event data");
                    }
                    MissingPartialPolicy::DropEvent => {
                        tracing::warn!(uuid = %event.uuid, path = %path.display(), "No partial event data, dropping event");
                        return Ok(None);
                    }
                    MissingPartialPolicy::FailJob => {
                        return Err(EventError::MissingPartial {
                            uuid: event.uuid,
                            path,
                        });
                    }
                }
            }
        }

        if event.event.is_empty() {
            event.event = VERBOSE_EVENT.to_string();
        }
        if event.created.is_none() {
            event.created = Some(Utc::now().to_rfc3339());
        }
        self.data_policy.apply(&mut event);

        let should_write = self.filter.as_ref().map_or(true, |filter| filter(&event));
        self.plugins.dispatch_event(&event);
        if !should_write {
            tracing::debug!(uuid = %event.uuid, counter = event.counter, "Event filter vetoed persistence");
            return Ok(None);
        }

        let path = self.event_path(&event);
        let written = serde_json::to_vec(&event)
            .map_err(EventError::from)
            .and_then(|json| write_atomic(&path, &json).map_err(EventError::from));
        match written {
            Ok(()) => {
                tracing::trace!(path = %path.display(), "Persisted event");
                Ok(Some(path))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed writing event data");
                Ok(None)
            }
        }
    }

    fn take_partial(&self, uuid: &str) -> Result<Option<Map<String, Value>>, EventError> {
        if let Some(partial) = self.partials.take(uuid, self.remove_partials)? {
            return Ok(Some(partial));
        }
        match base_uuid(uuid) {
            Some(base) => self.partials.take(base, self.remove_partials),
            None => Ok(None),
        }
    }
}

impl EventSink for EventPersister {
    fn on_event(&self, event: Event) -> Result<(), EventError> {
        self.persist(event).map(|_| ())
    }
}
