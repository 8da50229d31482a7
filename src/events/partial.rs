//! Partial event records written by the automation tool's plugin.
//!
//! The plugin runs inside the child process and drops a JSON file per event
//! uuid into the events directory; the persister later picks it up by uuid.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use super::error::EventError;
use crate::artifacts::{create_private_dir, write_atomic, JOB_EVENTS_DIR};

/// Environment variable naming the isolated data directory.
///
/// When it is unset the plugin writes no partial records.
pub const ISOLATED_DATA_DIR_ENV: &str = "AWX_ISOLATED_DATA_DIR";

/// Suffix of a partial record file name.
pub const PARTIAL_SUFFIX: &str = "-partial.json";

/// Keyed staging area for partial records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialEventStore {
    events_dir: PathBuf,
}

impl PartialEventStore {
    /// Store rooted at `<data_dir>/job_events`.
    #[must_use]
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            events_dir: data_dir.as_ref().join(JOB_EVENTS_DIR),
        }
    }

    /// Store rooted at the isolated data directory, if one is configured.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var_os(ISOLATED_DATA_DIR_ENV)
            .filter(|dir| !dir.is_empty())
            .map(Self::new)
    }

    #[must_use]
    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    /// Path of the partial record for `uuid`.
    #[must_use]
    pub fn path_for(&self, uuid: &str) -> PathBuf {
        self.events_dir.join(format!("{uuid}{PARTIAL_SUFFIX}"))
    }

    /// Stage `payload` as the partial record for `uuid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the file
    /// cannot be written.
    pub fn set<T: Serialize + ?Sized>(&self, uuid: &str, payload: &T) -> Result<PathBuf, EventError> {
        if !self.events_dir.exists() {
            create_private_dir(&self.events_dir)?;
        }
        let path = self.path_for(uuid);
        let json = serde_json::to_vec(payload)?;
        write_atomic(&path, &json)?;
        tracing::trace!(uuid, path = %path.display(), "Staged partial event");
        Ok(path)
    }

    /// Read the partial record for `uuid`, removing it when `remove` is set.
    ///
    /// Returns `Ok(None)` if no record has been staged.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn take(&self, uuid: &str, remove: bool) -> Result<Option<Map<String, Value>>, EventError> {
        let path = self.path_for(uuid);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = match serde_json::from_slice::<Value>(&content)? {
            Value::Object(map) => map,
            other => {
                tracing::warn!(uuid, value = %other, "Partial event is not an object, ignoring");
                Map::new()
            }
        };
        if remove {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(uuid, error = %e, "Failed to remove consumed partial event");
            }
        }
        Ok(Some(record))
    }
}
