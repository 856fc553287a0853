//! Transfer of finished archives to object storage.

pub mod blob;
pub mod progress;

pub use blob::{BlobUploader, UploadOptions};

use crate::archive::ArchiveArtifact;
use crate::utils::UploadError;
use async_trait::async_trait;

/// Places an archive in a destination container under `artifact.name`.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, artifact: &ArchiveArtifact, container: &str) -> Result<(), UploadError>;
}
