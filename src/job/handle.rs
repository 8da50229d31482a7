//! Read side of a job: status, return code, output artifacts and events.

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use futures_core::Stream;
use futures_util::stream::{self, TryStreamExt};
use tokio::sync::watch;

use super::RunnerError;
use crate::artifacts::ArtifactDir;
use crate::events::{wait_for_dir, Event, EventDirReader, Stats, DIRECTORY_WAIT, POLL_INTERVAL};
use crate::supervisor::JobStatus;

/// Cheap, cloneable view of one job.
///
/// Handles stay valid after the job finishes; every accessor reads from the
/// artifact directory or the last published status.
#[derive(Debug, Clone)]
pub struct JobHandle {
    ident: String,
    artifacts: ArtifactDir,
    status: watch::Receiver<JobStatus>,
}

enum Phase {
    WaitingForDir,
    Polling,
    Done,
}

struct EventCursor {
    reader: EventDirReader,
    status: watch::Receiver<JobStatus>,
    queue: VecDeque<Event>,
    phase: Phase,
}

impl JobHandle {
    pub(crate) fn new(
        ident: String,
        artifacts: ArtifactDir,
        status: watch::Receiver<JobStatus>,
    ) -> Self {
        Self {
            ident,
            artifacts,
            status,
        }
    }

    #[must_use]
    pub fn ident(&self) -> &str {
        &self.ident
    }

    #[must_use]
    pub fn artifact_dir(&self) -> &Path {
        self.artifacts.root()
    }

    /// Last published status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Wait until the job reaches a terminal status.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.status.clone();
        let waited = rx.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        waited.unwrap_or_else(|_| *rx.borrow())
    }

    /// Return code from the `rc` artifact.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::MissingArtifact` before the job has finished.
    pub fn rc(&self) -> Result<i32, RunnerError> {
        let path = self.artifacts.rc_path();
        let text = read_artifact(&path)?;
        text.trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| RunnerError::InvalidArtifact {
                path,
                reason: e.to_string(),
            })
    }

    /// Contents of the `stdout` artifact.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::MissingArtifact` if the job has not written it.
    pub fn stdout(&self) -> Result<String, RunnerError> {
        read_artifact(&self.artifacts.stdout_path())
    }

    /// Contents of the `stderr` artifact.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::MissingArtifact` if the job has not written it.
    pub fn stderr(&self) -> Result<String, RunnerError> {
        read_artifact(&self.artifacts.stderr_path())
    }

    /// Events in counter order.
    ///
    /// Until the job reaches a terminal status the directory is polled for
    /// new files; after that one final sweep is made and the stream ends.
    /// Each call starts over from the first event.
    pub fn events(&self) -> impl Stream<Item = Result<Event, RunnerError>> + Send + 'static {
        let cursor = EventCursor {
            reader: EventDirReader::new(self.artifacts.events_dir()),
            status: self.status.clone(),
            queue: VecDeque::new(),
            phase: Phase::WaitingForDir,
        };

        stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(event) = cursor.queue.pop_front() {
                    return Some((Ok(event), cursor));
                }
                match cursor.phase {
                    Phase::Done => return None,
                    Phase::WaitingForDir => {
                        if let Err(e) = wait_for_dir(cursor.reader.dir(), DIRECTORY_WAIT).await {
                            cursor.phase = Phase::Done;
                            return Some((Err(e.into()), cursor));
                        }
                        cursor.phase = Phase::Polling;
                    }
                    Phase::Polling => {
                        // A dropped sender means nobody will run the job any more.
                        let last_sweep = cursor.status.borrow().is_terminal()
                            || cursor.status.has_changed().is_err();
                        match cursor.reader.read_new_events().await {
                            Ok(events) => cursor.queue.extend(events),
                            Err(e) => {
                                cursor.phase = Phase::Done;
                                return Some((Err(e.into()), cursor));
                            }
                        }
                        if last_sweep {
                            cursor.phase = Phase::Done;
                        } else if cursor.queue.is_empty() {
                            tokio::time::sleep(POLL_INTERVAL).await;
                        }
                    }
                }
            }
        })
    }

    /// Collect [`events`](Self::events) into a vector.
    ///
    /// # Errors
    ///
    /// Returns the first error the event stream yields.
    pub async fn all_events(&self) -> Result<Vec<Event>, RunnerError> {
        self.events().try_collect().await
    }

    /// Per-host tallies from the summary event, if the job got that far.
    ///
    /// # Errors
    ///
    /// Returns the first error the event stream yields.
    pub async fn stats(&self) -> Result<Option<Stats>, RunnerError> {
        let events = self.all_events().await?;
        Ok(events.iter().rev().find_map(Stats::from_event))
    }

    /// Events whose `event_data.host` is `host`.
    ///
    /// # Errors
    ///
    /// Returns the first error the event stream yields.
    pub async fn host_events(&self, host: &str) -> Result<Vec<Event>, RunnerError> {
        let events = self.all_events().await?;
        Ok(events
            .into_iter()
            .filter(|event| event.host() == Some(host))
            .collect())
    }
}

fn read_artifact(path: &Path) -> Result<String, RunnerError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => RunnerError::MissingArtifact(path.to_path_buf()),
        _ => RunnerError::Io(e),
    })
}
