//! Job artifact directory.
//!
//! Layout under the artifact root:
//!
//! ```text
//! command                  argv/cwd/env written before spawning
//! stdout, stderr           human-readable output with markers removed
//! status, rc               final state and return code
//! job_events/<counter>-<uuid>.json
//! job_events/<uuid>-partial.json
//! ```
//!
//! Every file other readers may pick up concurrently is written to a `.tmp`
//! sibling first and renamed into place.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::supervisor::JobStatus;

/// Name of the events subdirectory.
pub const JOB_EVENTS_DIR: &str = "job_events";

/// Errors from artifact directory operations.
#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    /// Failed to create a directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write an artifact file.
    #[error("Failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to serialize an artifact.
    #[error("Artifact serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The `command` artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Write `contents` to `path` through a `.tmp` sibling and an atomic rename.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be written or renamed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = create_private(&tmp)?;
        file.write_all(contents)?;
        file.flush()?;
    }
    fs::rename(&tmp, path)
}

/// `<path>.tmp`
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Create (or truncate) a file readable only by the owner.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn create_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Create a directory (and parents) accessible only by the owner.
///
/// # Errors
///
/// Returns `ArtifactError::CreateDir` on failure.
pub fn create_private_dir(path: &Path) -> Result<(), ArtifactError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|source| ArtifactError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

/// Paths and writers for one job's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn events_dir(&self) -> PathBuf {
        self.root.join(JOB_EVENTS_DIR)
    }

    #[must_use]
    pub fn stdout_path(&self) -> PathBuf {
        self.root.join("stdout")
    }

    #[must_use]
    pub fn stderr_path(&self) -> PathBuf {
        self.root.join("stderr")
    }

    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.root.join("status")
    }

    #[must_use]
    pub fn rc_path(&self) -> PathBuf {
        self.root.join("rc")
    }

    #[must_use]
    pub fn command_path(&self) -> PathBuf {
        self.root.join("command")
    }

    /// Create the artifact root and the events directory.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::CreateDir` if either cannot be created.
    pub fn prepare(&self) -> Result<(), ArtifactError> {
        create_private_dir(&self.root)?;
        create_private_dir(&self.events_dir())
    }

    /// Write the `command` artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub fn write_command(&self, record: &CommandRecord) -> Result<(), ArtifactError> {
        let path = self.command_path();
        let json = serde_json::to_vec(record)?;
        write_atomic(&path, &json).map_err(|source| ArtifactError::Write { path, source })
    }

    /// Write the final `status` and `rc` artifacts.
    ///
    /// # Errors
    ///
    /// Returns `ArtifactError::Write` if either file cannot be written.
    pub fn write_outcome(&self, status: JobStatus, rc: i32) -> Result<(), ArtifactError> {
        for (path, data) in [
            (self.status_path(), status.as_str().to_string()),
            (self.rc_path(), rc.to_string()),
        ] {
            create_private(&path)
                .and_then(|mut file| file.write_all(data.as_bytes()))
                .map_err(|source| ArtifactError::Write { path, source })?;
        }
        Ok(())
    }

    /// Keep only the `keep` most recently modified sibling artifact directories.
    ///
    /// Zero disables rotation. Failures to remove individual directories are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be listed.
    pub fn rotate(&self, keep: usize) -> io::Result<()> {
        if keep == 0 {
            return Ok(());
        }
        let Some(parent) = self.root.parent() else {
            return Ok(());
        };

        let mut dirs: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(parent)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir() && entry.path() != self.root)
            .filter_map(|entry| {
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, entry.path()))
            })
            .collect();
        dirs.sort();

        // The current directory always counts as one of the kept.
        let excess = dirs.len().saturating_sub(keep - 1);
        for (_, path) in dirs.into_iter().take(excess) {
            match fs::remove_dir_all(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed rotated artifact directory"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to rotate artifact directory"),
            }
        }
        Ok(())
    }
}
