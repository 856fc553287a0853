//! Backup Sidecar Library
//!
//! Archives configured directories on a schedule and uploads them to Azure
//! Blob Storage.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod scheduler;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::SidecarConfig;
pub use executor::{BackupRunner, RunSummary};
pub use utils::errors::SidecarError;
pub type Result<T> = std::result::Result<T, SidecarError>;
