//! Configuration for the backup sidecar.
//!
//! Process-wide settings come from environment variables (optionally seeded
//! from a `.env` file) and are read once at startup. The job list lives in a
//! YAML file that is re-read at the start of every backup run.

use crate::scheduler::Schedule;
use crate::utils::Result;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/config/backup-config.yaml";
pub const DEFAULT_CONTAINER: &str = "backups";

/// Process-wide sidecar configuration.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// YAML job list location
    pub config_path: PathBuf,

    /// Destination identity and credential
    pub storage: StorageSettings,

    /// Active scheduling policy
    pub schedule: Schedule,

    /// Run once at startup in addition to the schedule
    pub immediate: bool,

    /// Where archives are written before upload
    pub scratch_dir: PathBuf,
}

/// Blob storage destination. Values may be empty; the runner validates them
/// before every run.
#[derive(Clone, Default)]
pub struct StorageSettings {
    pub account_name: String,
    pub container: String,
    pub sas_token: String,

    /// Endpoint override (Azurite, sovereign clouds)
    pub account_url: Option<String>,
}

impl StorageSettings {
    /// Names of the required environment variables that are empty.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.account_name.trim().is_empty() {
            missing.push("STORAGE_ACCOUNT_NAME");
        }
        if self.container.trim().is_empty() {
            missing.push("CONTAINER_NAME");
        }
        if self.sas_token.trim().is_empty() {
            missing.push("BLOB_SAS_TOKEN");
        }
        missing
    }

    /// Blob service endpoint for the account.
    pub fn account_url(&self) -> String {
        self.account_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", self.account_name))
    }
}

impl fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSettings")
            .field("account_name", &self.account_name)
            .field("container", &self.container)
            .field("sas_token", &if self.sas_token.is_empty() { "" } else { "<redacted>" })
            .field("account_url", &self.account_url)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleMode {
    Interval,
    Daily,
    Calendar,
}

impl SidecarConfig {
    /// Load configuration from the process environment. A `.env` file, if
    /// any, must already have been applied by the caller.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty optional variables behave like unset ones.
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage = StorageSettings {
            account_name: lookup("STORAGE_ACCOUNT_NAME").unwrap_or_default(),
            container: lookup("CONTAINER_NAME").unwrap_or_else(|| DEFAULT_CONTAINER.to_string()),
            sas_token: lookup("BLOB_SAS_TOKEN").unwrap_or_default(),
            account_url: get("STORAGE_ACCOUNT_URL"),
        };

        let mode = match get("SCHEDULE_MODE").map(|m| m.trim().to_ascii_lowercase()) {
            Some(m) if m == "interval" => ScheduleMode::Interval,
            Some(m) if m == "daily" => ScheduleMode::Daily,
            Some(m) if m == "calendar" => ScheduleMode::Calendar,
            other => {
                if let Some(m) = other {
                    warn!(value = %m, "Unknown SCHEDULE_MODE, inferring from other variables");
                }
                if get("SCHEDULE_INTERVAL").is_some() || get("SCHEDULE_TIME").is_some() {
                    ScheduleMode::Calendar
                } else if get("BACKUP_TIME").is_some() {
                    ScheduleMode::Daily
                } else {
                    ScheduleMode::Interval
                }
            }
        };

        let timezone = get("TIMEZONE");
        let schedule = match mode {
            ScheduleMode::Interval => Schedule::interval_from(get("BACKUP_INTERVAL_SECONDS").as_deref()),
            ScheduleMode::Daily => Schedule::daily_from(get("BACKUP_TIME").as_deref(), timezone.as_deref()),
            ScheduleMode::Calendar => Schedule::calendar_from(
                get("SCHEDULE_INTERVAL").as_deref(),
                get("SCHEDULE_TIME").as_deref(),
                timezone.as_deref(),
            ),
        };

        Self {
            config_path: get("CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            storage,
            schedule,
            immediate: get("IMMEDIATE").map(|v| parse_flag(&v)).unwrap_or(false),
            scratch_dir: get("BACKUP_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Top-level layout of the YAML job list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub backups: Option<Vec<BackupJobSpec>>,
}

/// One directory to archive and upload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupJobSpec {
    /// Directory to back up
    pub path: PathBuf,

    /// Optional blob name prefix
    #[serde(default)]
    prefix: Option<String>,
}

impl BackupJobSpec {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: Some(prefix.into()),
        }
    }

    /// Prefix, or `""` when none is configured.
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or("")
    }
}

/// Parse a YAML job list. An empty document yields no jobs.
pub fn parse_jobs(content: &str) -> Result<Vec<BackupJobSpec>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let config: BackupConfig = serde_yaml::from_str(content)?;
    Ok(config.backups.unwrap_or_default())
}

/// Read and parse the job list at `path`.
pub async fn load_jobs(path: &Path) -> Result<Vec<BackupJobSpec>> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_jobs(&content)
}
