//! Backup job runner - one pass over every configured job.
//!
//! Each job goes through archive then upload. A failing job is logged and
//! abandoned for this run; it never stops the jobs after it.

use crate::archive::{ArchiveArtifact, Archiver};
use crate::config::{self, BackupJobSpec, StorageSettings};
use crate::scheduler::CycleRunner;
use crate::transfer::Uploader;
use crate::utils::{Result, SidecarError};
use async_trait::async_trait;
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Counters for one run. Only used for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,

    /// The run stopped before processing any job
    pub aborted: bool,
}

impl RunSummary {
    fn aborted() -> Self {
        Self {
            aborted: true,
            ..Self::default()
        }
    }
}

/// What happened to a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobOutcome {
    Uploaded,
    SourceMissing,
}

/// Drives config source, archiver and uploader for every job.
pub struct BackupRunner {
    config_path: PathBuf,
    storage: StorageSettings,
    scratch_dir: PathBuf,
    archiver: Arc<dyn Archiver>,
    uploader: Arc<dyn Uploader>,
}

impl BackupRunner {
    pub fn new(
        config_path: PathBuf,
        storage: StorageSettings,
        scratch_dir: PathBuf,
        archiver: Arc<dyn Archiver>,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        Self {
            config_path,
            storage,
            scratch_dir,
            archiver,
            uploader,
        }
    }

    /// Back up every configured job, in order.
    ///
    /// Stops between jobs once `shutdown` is cancelled.
    pub async fn run_all(&self, shutdown: &CancellationToken) -> RunSummary {
        let missing = self.storage.missing();
        if !missing.is_empty() {
            let err = SidecarError::ConfigMissing(missing.join(", "));
            error!(error = %err, "Storage settings incomplete, skipping backup run");
            return RunSummary::aborted();
        }

        let jobs = match config::load_jobs(&self.config_path).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(
                    config = %self.config_path.display(),
                    error = %e,
                    "Failed to load backup config"
                );
                return RunSummary::aborted();
            }
        };

        if jobs.is_empty() {
            warn!(config = %self.config_path.display(), "No backup jobs configured");
            return RunSummary::default();
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.scratch_dir).await {
            error!(
                scratch_dir = %self.scratch_dir.display(),
                error = %e,
                "Cannot create scratch directory"
            );
            return RunSummary::aborted();
        }

        let mut summary = RunSummary::default();
        for job in &jobs {
            if shutdown.is_cancelled() {
                warn!("Shutdown requested, leaving remaining jobs for the next run");
                break;
            }

            match self.run_job(job).await {
                Ok(JobOutcome::Uploaded) => summary.succeeded += 1,
                Ok(JobOutcome::SourceMissing) => summary.skipped += 1,
                Err(e) => {
                    error!(source = %job.path.display(), error = %e, "Backup failed");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn run_job(&self, job: &BackupJobSpec) -> Result<JobOutcome> {
        if !tokio::fs::try_exists(&job.path).await.unwrap_or(false) {
            warn!(source = %job.path.display(), "Directory does not exist, skipping");
            return Ok(JobOutcome::SourceMissing);
        }

        let artifact = ArchiveArtifact::plan(
            &job.path,
            job.prefix(),
            &self.scratch_dir,
            Local::now().naive_local(),
        )?;

        if let Err(e) = self.archiver.archive(&job.path, &artifact).await {
            artifact.discard().await;
            return Err(e.into());
        }

        // The local archive goes away whether or not the upload worked.
        let uploaded = self.uploader.upload(&artifact, &self.storage.container).await;
        artifact.discard().await;
        uploaded?;

        info!(
            source = %job.path.display(),
            blob = %artifact.name,
            "Successfully backed up"
        );
        Ok(JobOutcome::Uploaded)
    }
}

#[async_trait]
impl CycleRunner for BackupRunner {
    async fn run_cycle(&self, shutdown: &CancellationToken) {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        async {
            info!("Backup run started");
            let summary = self.run_all(shutdown).await;
            if summary.aborted {
                warn!("Backup run aborted");
            } else {
                info!(
                    succeeded = summary.succeeded,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Backup run finished"
                );
            }
        }
        .instrument(info_span!("backup_run", %run_id))
        .await
    }
}
