//! `tar` subprocess archiver.
//!
//! Arguments are passed as a list, never through a shell, so path segments are
//! never interpreted.

use super::{ArchiveArtifact, Archiver};
use crate::utils::ArchiveError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Archiver backed by the system `tar` binary (gzip compression).
#[derive(Debug, Clone)]
pub struct TarArchiver {
    program: PathBuf,
}

impl TarArchiver {
    pub fn new() -> Self {
        Self::with_program("tar")
    }

    /// Use a specific tar executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn archive(&self, source: &Path, artifact: &ArchiveArtifact) -> Result<(), ArchiveError> {
        let base = source
            .file_name()
            .ok_or_else(|| ArchiveError::InvalidSource(source.to_path_buf()))?;
        // Extraction must reproduce `base/...`, so run from the parent.
        let parent = source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        debug!(
            source = %source.display(),
            archive = %artifact.file_path.display(),
            "Running tar"
        );

        let output = Command::new(&self.program)
            .arg("-czf")
            .arg(&artifact.file_path)
            .arg("-C")
            .arg(parent)
            .arg("--")
            .arg(base)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ArchiveError::Spawn)?;

        if !output.status.success() {
            return Err(ArchiveError::CompressionFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}
