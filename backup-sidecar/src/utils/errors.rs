//! Custom error types for the backup sidecar.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Missing required environment variables: {0}")]
    ConfigMissing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid backup config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
}

/// Failure while producing an archive for a single job.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("cannot derive a directory name from {}", .0.display())]
    InvalidSource(PathBuf),

    #[error("failed to start tar: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("compression failed (exit code {}): {stderr}", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    CompressionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

/// Failure while transferring an archive to the object store.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to read archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid blob endpoint: {0}")]
    Endpoint(String),

    #[error("store rejected upload with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, SidecarError>;
