//! Error types for the recording engine.

use thiserror::Error;

/// Result type for recorder operations.
pub type Result<T> = std::result::Result<T, RecorderError>;

/// Errors that can occur while recording, indexing or evicting episodes.
#[derive(Error, Debug)]
pub enum RecorderError {
    /// The encoder session could not be opened or written. The episode attempt
    /// is abandoned and the recorder stays idle until the next context change.
    #[error("recording unavailable: {0}")]
    RecordingUnavailable(String),

    /// A single interval failed to reach the search index. The observation is
    /// dropped; recording continues.
    #[error("index write failed: {0}")]
    IndexWrite(String),

    /// Structured record store failure, retryable at the operation boundary.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Index schema migration failed; the stored version is left unbumped so
    /// the migration reruns on next startup.
    #[error("migration failed: {0}")]
    Migration(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
