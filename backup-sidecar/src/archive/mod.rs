//! Archive naming and the `Archiver` seam.
//!
//! An archive is named `{prefix_}{dir}_{YYYYMMDD_HHMMSS}.tar.gz` and written to
//! the scratch directory. The same name is used as the blob key on upload.

pub mod tar;

use crate::utils::ArchiveError;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tracing::warn;

pub use self::tar::TarArchiver;

/// Second-precision timestamp embedded in every archive name.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Produces a compressed archive of a directory.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive `source` into `artifact.file_path`.
    ///
    /// The caller has already checked that `source` exists.
    async fn archive(&self, source: &Path, artifact: &ArchiveArtifact) -> Result<(), ArchiveError>;
}

/// A single archive file owned by one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    /// Location of the archive in the scratch directory
    pub file_path: PathBuf,

    /// Archive file name, also the destination blob name
    pub name: String,
}

impl ArchiveArtifact {
    /// Compute the name and scratch location for archiving `source` at `timestamp`.
    pub fn plan(
        source: &Path,
        prefix: &str,
        scratch_dir: &Path,
        timestamp: NaiveDateTime,
    ) -> Result<Self, ArchiveError> {
        let name = artifact_name(source, prefix, timestamp)
            .ok_or_else(|| ArchiveError::InvalidSource(source.to_path_buf()))?;

        Ok(Self {
            file_path: scratch_dir.join(&name),
            name,
        })
    }

    /// Remove the local archive file. A missing file is not an error.
    pub async fn discard(&self) {
        match tokio::fs::remove_file(&self.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                archive = %self.file_path.display(),
                error = %e,
                "Failed to remove local archive"
            ),
        }
    }
}

/// Final component of `source`, ignoring trailing separators.
pub fn base_dir_name(source: &Path) -> Option<String> {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// Deterministic archive name for `source` with an optional `prefix`.
///
/// Returns `None` when the path has no final component (for example `/`).
pub fn artifact_name(source: &Path, prefix: &str, timestamp: NaiveDateTime) -> Option<String> {
    let base = base_dir_name(source)?;
    let stamp = timestamp.format(TIMESTAMP_FORMAT);

    Some(if prefix.is_empty() {
        format!("{}_{}.tar.gz", base, stamp)
    } else {
        format!("{}_{}_{}.tar.gz", prefix, base, stamp)
    })
}
