//! Event pipeline error types.

use std::path::PathBuf;

/// A marker span that could not be turned back into a payload.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The span did not contain valid base64.
    #[error("Invalid base64 in event marker: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded bytes were not UTF-8.
    #[error("Event marker is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The decoded text was not a JSON object.
    #[error("Event marker is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    /// The JSON was valid but not an object.
    #[error("Event marker payload is not an object")]
    NotAnObject,
}

/// Errors raised while scanning, merging or persisting events.
#[derive(thiserror::Error, Debug)]
pub enum EventError {
    /// No partial record arrived for an event and strict mode is on.
    #[error("Missing partial event data for {uuid} at {}", path.display())]
    MissingPartial { uuid: String, path: PathBuf },

    /// The events directory never appeared.
    #[error("Events directory is missing: {0}")]
    DirectoryMissing(PathBuf),

    /// Failed to serialize or parse an event record.
    #[error("Event JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to prepare the events directory.
    #[error(transparent)]
    Artifact(#[from] crate::artifacts::ArtifactError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
