//! Event records reconstructed from a job's output.
//!
//! An [`Event`] is assembled from two halves: the stream half (uuid, text,
//! counter and line offsets) produced by the scanner, and an optional partial
//! half (event tag, creation time, structured data) written by the automation
//! tool's plugin. Both halves are plain JSON objects on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tag given to text that appeared outside any marker.
pub const VERBOSE_EVENT: &str = "verbose";

/// Tag of the sentinel emitted when a scanner is closed.
pub const EOF_EVENT: &str = "EOF";

/// Tag of the lifecycle-summary event carrying per-host tallies.
pub const STATS_EVENT: &str = "playbook_on_stats";

/// Event tags whose data survives `only_failed_event_data`.
pub const FAILURE_EVENTS: [&str; 3] = [
    "runner_on_failed",
    "runner_on_async_failed",
    "runner_on_item_failed",
];

/// Keys owned by the stream half; a partial record never overrides them.
const STREAM_KEYS: [&str; 5] = ["uuid", "counter", "stdout", "start_line", "end_line"];

/// One structured record of something that happened during a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Kind of event, e.g. `runner_on_ok` or `verbose`.
    #[serde(default)]
    pub event: String,
    /// Identifier shared by the stream and partial halves.
    #[serde(default)]
    pub uuid: String,
    /// Position of this event in the job's total order.
    #[serde(default)]
    pub counter: u64,
    /// Human-readable text covered by this event.
    #[serde(default)]
    pub stdout: String,
    /// First line of the cumulative stdout covered by this event.
    #[serde(default)]
    pub start_line: usize,
    /// Line after the last one covered by this event.
    #[serde(default)]
    pub end_line: usize,
    /// Creation timestamp (ISO-8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Process id that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Open structured payload from the partial record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<Value>,
    /// Any other top-level keys (`runner_ident`, `parent_uuid`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// A `verbose` event with a freshly generated uuid.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            event: VERBOSE_EVENT.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// The end-of-stream sentinel.
    #[must_use]
    pub fn eof() -> Self {
        Self {
            event: EOF_EVENT.to_string(),
            ..Default::default()
        }
    }

    /// Returns true for the end-of-stream sentinel.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.event == EOF_EVENT && self.uuid.is_empty()
    }

    /// Returns true if this is a `verbose` event.
    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.event == VERBOSE_EVENT
    }

    /// Returns true if the event tag is one of [`FAILURE_EVENTS`].
    #[must_use]
    pub fn is_failure(&self) -> bool {
        FAILURE_EVENTS.contains(&self.event.as_str())
    }

    /// Build the stream half of an event from a decoded marker payload.
    #[must_use]
    pub fn from_marker(fields: Map<String, Value>) -> Self {
        let mut event = Self::default();
        event.absorb(fields, true);
        event
    }

    /// Merge a partial record into this event.
    ///
    /// Partial fields win for everything except the stream-owned keys
    /// (`uuid`, `counter`, `stdout`, `start_line`, `end_line`).
    pub fn merge_partial(&mut self, partial: Map<String, Value>) {
        self.absorb(partial, false);
    }

    /// Host named in `event_data.host`, if any.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.event_data.as_ref()?.get("host")?.as_str()
    }

    fn absorb(&mut self, fields: Map<String, Value>, stream_side: bool) {
        for (key, value) in fields {
            if !stream_side && STREAM_KEYS.contains(&key.as_str()) {
                continue;
            }
            match key.as_str() {
                "event" => {
                    if let Some(tag) = value.as_str() {
                        self.event = tag.to_string();
                    }
                }
                "uuid" => {
                    if let Some(uuid) = value.as_str() {
                        self.uuid = uuid.to_string();
                    }
                }
                "counter" => self.counter = value.as_u64().unwrap_or(self.counter),
                "stdout" => {
                    if let Some(text) = value.as_str() {
                        self.stdout = text.to_string();
                    }
                }
                "start_line" => {
                    self.start_line = value.as_u64().map_or(self.start_line, to_usize);
                }
                "end_line" => self.end_line = value.as_u64().map_or(self.end_line, to_usize),
                "created" => self.created = value.as_str().map(str::to_string),
                "pid" => self.pid = value.as_u64().and_then(|pid| u32::try_from(pid).ok()),
                "event_data" => self.event_data = Some(value),
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Per-host tallies extracted from the lifecycle-summary event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub ok: BTreeMap<String, u64>,
    pub changed: BTreeMap<String, u64>,
    pub failures: BTreeMap<String, u64>,
    pub skipped: BTreeMap<String, u64>,
    pub dark: BTreeMap<String, u64>,
    pub ignored: BTreeMap<String, u64>,
    pub rescued: BTreeMap<String, u64>,
    pub processed: BTreeMap<String, u64>,
}

impl Stats {
    /// Extract tallies from a summary event, if `event` is one.
    #[must_use]
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.event != STATS_EVENT {
            return None;
        }
        match event.event_data.as_ref() {
            Some(data) => serde_json::from_value(data.clone()).ok(),
            None => Some(Self::default()),
        }
    }
}
