use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::models::device::{Device, DEVICE_SCHEMA_VERSION};
use crate::policy::rules::PolicyRule;
use crate::timekeeper::TimeEntry;

/// On-disk layout versions for the two non-device records
pub const RULESET_SCHEMA_VERSION: u32 = 1;
pub const TRACKER_SCHEMA_VERSION: u32 = 1;

/// Error types for persistence operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Unsupported schema version {found} in {path}")]
    UnsupportedSchema { path: String, found: u32 },
}

/// Result type for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted rule set record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetRecord {
    pub schema_version: u32,
    pub rules: Vec<PolicyRule>,
}

/// Persisted time-tracker extras: per-device entries plus the
/// last-reset-date marker that guards the daily reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerRecord {
    pub schema_version: u32,
    pub last_reset_date: Option<NaiveDate>,
    pub entries: Vec<(String, TimeEntry)>,
}

/// File-backed store: one JSON file per device under `devices/`, one
/// `rules.json` for the active rule set, one `tracker.json` for
/// time-tracking extras. Each record is written to a temp file and
/// renamed into place, so a write that dies partway never corrupts
/// other entries.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("devices")).await?;
        Ok(Self { root })
    }

    fn device_path(&self, mac: &str) -> PathBuf {
        // MACs are already normalized; colons are not filesystem-friendly
        self.root
            .join("devices")
            .join(format!("{}.json", mac.replace(':', "-")))
    }

    fn rules_path(&self) -> PathBuf {
        self.root.join("rules.json")
    }

    fn tracker_path(&self) -> PathBuf {
        self.root.join("tracker.json")
    }

    /// Atomic write: temp file in the same directory, flush, rename
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
        }
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Persist a single device record
    pub async fn save_device(&self, device: &Device) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(device)?;
        self.write_atomic(&self.device_path(&device.mac_address), &bytes)
            .await?;
        debug!("Persisted device record for {}", device.mac_address);
        Ok(())
    }

    /// Load every device record. Unreadable records and records from a
    /// newer schema are skipped with a warning rather than failing the
    /// whole load.
    pub async fn load_devices(&self) -> StoreResult<Vec<Device>> {
        let mut devices = Vec::new();
        let mut entries = fs::read_dir(self.root.join("devices")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Device>(&bytes) {
                    Ok(device) if device.schema_version > DEVICE_SCHEMA_VERSION => warn!(
                        "Skipping device record {:?} with unsupported schema version {}",
                        path, device.schema_version
                    ),
                    Ok(device) => devices.push(device),
                    Err(e) => warn!("Skipping unreadable device record {:?}: {}", path, e),
                },
                Err(e) => warn!("Failed to read device record {:?}: {}", path, e),
            }
        }

        Ok(devices)
    }

    /// Persist the active rule set
    pub async fn save_rules(&self, rules: &[PolicyRule]) -> StoreResult<()> {
        let record = RuleSetRecord {
            schema_version: RULESET_SCHEMA_VERSION,
            rules: rules.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        self.write_atomic(&self.rules_path(), &bytes).await
    }

    /// Load the rule set, or None if it was never saved
    pub async fn load_rules(&self) -> StoreResult<Option<Vec<PolicyRule>>> {
        let path = self.rules_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        let record: RuleSetRecord = serde_json::from_slice(&bytes)?;
        if record.schema_version > RULESET_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                path: path.display().to_string(),
                found: record.schema_version,
            });
        }
        Ok(Some(record.rules))
    }

    /// Persist the time-tracker extras
    pub async fn save_tracker(&self, record: &TrackerRecord) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        self.write_atomic(&self.tracker_path(), &bytes).await
    }

    /// Load the time-tracker extras, or None on first run
    pub async fn load_tracker(&self) -> StoreResult<Option<TrackerRecord>> {
        let path = self.tracker_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        let record: TrackerRecord = serde_json::from_slice(&bytes)?;
        if record.schema_version > TRACKER_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                path: path.display().to_string(),
                found: record.schema_version,
            });
        }
        Ok(Some(record))
    }
}
