pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::device::{Device, ValidationError};
use crate::models::observation::{normalize_mac, Observation};
use crate::registry::store::{FileStore, StoreError};

/// Error types for registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("Observation carries no MAC address ({0})")]
    MissingMac(String),

    #[error("No device registered for MAC {0}")]
    DeviceNotFound(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Handle to one device's record. Cloning is cheap; the inner lock is
/// what serializes cycle updates against manual overrides.
pub type DeviceHandle = Arc<RwLock<Device>>;

/// Durable store of known devices keyed by normalized MAC address.
///
/// The map itself is read-locked for lookups; each device sits behind
/// its own lock so two devices can be updated concurrently while a
/// given record never has two writers at once.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceHandle>>,
    store: Option<Arc<FileStore>>,
    default_daily_limit_min: u32,
}

impl DeviceRegistry {
    /// In-memory registry with no persistence (tests, dry runs)
    pub fn in_memory(default_daily_limit_min: u32) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            store: None,
            default_daily_limit_min,
        }
    }

    /// Registry backed by a file store, pre-loaded with every record on
    /// disk. Loaded devices start out disconnected until a discovery
    /// pass sees them again.
    pub async fn with_store(
        store: Arc<FileStore>,
        default_daily_limit_min: u32,
    ) -> RegistryResult<Self> {
        let mut map = HashMap::new();
        for mut device in store.load_devices().await? {
            device.is_connected = false;
            map.insert(device.mac_address.clone(), Arc::new(RwLock::new(device)));
        }
        info!("Registry loaded {} device record(s) from disk", map.len());
        Ok(Self {
            devices: RwLock::new(map),
            store: Some(store),
            default_daily_limit_min,
        })
    }

    /// Merge an observation into the registry by MAC address.
    ///
    /// A known MAC keeps its classification, block state, sites and
    /// time budget and only takes fresh connectivity data; an unknown
    /// MAC becomes a new record with engine defaults. Returns the
    /// handle plus whether the device is newly created.
    pub async fn upsert(
        &self,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> RegistryResult<(DeviceHandle, bool)> {
        let mac = match &observation.mac_address {
            Some(raw) => normalize_mac(raw)?,
            None => {
                return Err(RegistryError::MissingMac(
                    observation.ip_address.to_string(),
                ))
            }
        };

        // Fast path: known device, overlay connectivity only
        if let Some(handle) = self.get(&mac).await {
            let mut device = handle.write().await;
            device.ip_address = Some(observation.ip_address);
            if observation.hostname.is_some() {
                device.hostname = observation.hostname.clone();
            }
            device.last_seen = now;
            device.is_connected = true;
            drop(device);
            return Ok((handle, false));
        }

        let mut device = Device::new(mac.clone(), self.default_daily_limit_min, now);
        device.ip_address = Some(observation.ip_address);
        device.hostname = observation.hostname.clone();

        debug!("New device discovered: {} ({})", mac, observation.ip_address);

        let handle = Arc::new(RwLock::new(device));
        self.devices
            .write()
            .await
            .insert(mac.clone(), handle.clone());
        Ok((handle, true))
    }

    /// Look up a device by normalized MAC
    pub async fn get(&self, mac: &str) -> Option<DeviceHandle> {
        self.devices.read().await.get(mac).cloned()
    }

    /// Look up a device, erroring when it is unknown
    pub async fn require(&self, mac: &str) -> RegistryResult<DeviceHandle> {
        self.get(mac)
            .await
            .ok_or_else(|| RegistryError::DeviceNotFound(mac.to_string()))
    }

    /// Snapshot of every device handle
    pub async fn all(&self) -> Vec<DeviceHandle> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Number of known devices
    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Flag devices missing from the latest discovery pass as
    /// disconnected. Only the connectivity flag changes; records are
    /// never removed.
    pub async fn mark_absent(&self, seen_macs: &HashSet<String>) {
        for (mac, handle) in self.devices.read().await.iter() {
            if !seen_macs.contains(mac) {
                let mut device = handle.write().await;
                if device.is_connected {
                    debug!("Device {} dropped off the network", mac);
                    device.is_connected = false;
                }
            }
        }
    }

    /// Validate and persist one device record. Invalid records are
    /// rejected before anything touches disk.
    pub async fn save(&self, device: &Device) -> RegistryResult<()> {
        device.validate()?;
        if let Some(store) = &self.store {
            store.save_device(device).await?;
        }
        Ok(())
    }

    /// Persist every record, logging rather than failing on individual
    /// write errors. Used at shutdown.
    pub async fn save_all(&self) {
        for handle in self.all().await {
            let device = handle.read().await;
            if let Err(e) = self.save(&device).await {
                warn!("Failed to persist device {}: {}", device.mac_address, e);
            }
        }
    }
}
