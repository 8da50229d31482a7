//! Incremental reader for a job's events directory.
//!
//! Only final `<counter>-<uuid>.json` files are considered. Because every
//! writer renames complete files into place, any file listed here can be read
//! without locking.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::EventError;
use super::types::Event;

/// How long to wait for the events directory before giving up.
pub const DIRECTORY_WAIT: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the directory or new files.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counter prefix of a final event file name, or `None` for anything else
/// (partials, temp files, stray files).
#[must_use]
pub fn event_file_counter(name: &str) -> Option<u64> {
    if name.contains("-partial") {
        return None;
    }
    let stem = name.strip_suffix(".json")?;
    let (counter, uuid) = stem.split_once('-')?;
    if uuid.is_empty() || counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    counter.parse().ok()
}

/// Wait until `dir` exists, polling every [`POLL_INTERVAL`].
///
/// # Errors
///
/// Returns `EventError::DirectoryMissing` if `timeout` elapses first.
pub async fn wait_for_dir(dir: &Path, timeout: Duration) -> Result<(), EventError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EventError::DirectoryMissing(dir.to_path_buf()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Yields each event file once, in counter order.
#[derive(Debug)]
pub struct EventDirReader {
    dir: PathBuf,
    seen: HashSet<String>,
}

impl EventDirReader {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: HashSet::new(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Forget what has been read so the next sweep replays everything.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Read events that appeared since the last sweep.
    ///
    /// A file that fails to parse ends the sweep early; it and everything
    /// after it are retried on the next call.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DirectoryMissing` if the directory does not exist,
    /// or an I/O error if it cannot be listed.
    pub async fn read_new_events(&mut self) -> Result<Vec<Event>, EventError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EventError::DirectoryMissing(self.dir.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut fresh = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if self.seen.contains(&name) {
                continue;
            }
            if let Some(counter) = event_file_counter(&name) {
                fresh.push((counter, name));
            }
        }
        fresh.sort();

        let mut events = Vec::with_capacity(fresh.len());
        for (_, name) in fresh {
            let path = self.dir.join(&name);
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Event file unreadable, retrying later");
                    break;
                }
            };
            match serde_json::from_slice::<Event>(&content) {
                Ok(event) => {
                    self.seen.insert(name);
                    events.push(event);
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Event file not parseable yet");
                    break;
                }
            }
        }
        Ok(events)
    }
}
