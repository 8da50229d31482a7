//! Job-level error type.

use std::path::PathBuf;

use crate::artifacts::ArtifactError;
use crate::config::ConfigError;
use crate::events::EventError;
use crate::supervisor::SupervisorError;

/// Errors returned by [`Runner`](super::Runner) and [`JobHandle`](super::JobHandle).
#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Event(#[from] EventError),

    /// An artifact was requested before the job produced it.
    #[error("Artifact does not exist yet: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// An artifact exists but holds something unexpected.
    #[error("Invalid artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// True for the cancel and finished callback failures.
    #[must_use]
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Supervisor(SupervisorError::Callback(..)))
    }
}
