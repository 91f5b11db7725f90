use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::device::BlockReason;
use crate::models::observation::Observation;
use crate::policy::rules::Action;

/// Error types for external collaborator calls
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Adapter did not respond within {0} ms")]
    Timeout(u64),

    #[error("Adapter failure: {0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed adapter data: {0}")]
    BadData(#[from] serde_json::Error),
}

/// Result type for adapter calls
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Acknowledgement from the action sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Whether the network layer actually changed state. Re-applying
    /// an action the sink already holds must come back unchanged.
    pub changed: bool,
}

/// Supplies freshly observed devices each discovery pass. The engine
/// always calls this under a timeout; implementations may fan out
/// per-host probes internally but must return within the caller's
/// budget.
#[async_trait]
pub trait DiscoveryAdapter: Send + Sync {
    async fn discover(&self) -> AdapterResult<Vec<Observation>>;
}

/// Applies enforcement decisions to the network layer. Must be
/// idempotent: applying the same action for the same device twice is a
/// no-op on the network.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn apply(&self, mac: &str, action: Action, reason: BlockReason) -> AdapterResult<Ack>;
}

/// Discovery adapter that reads observations from a JSON file. A thin
/// stand-in for a real ARP/mDNS scanner: an external tool (or a human)
/// drops the current host table at the path and the engine picks it up
/// every cycle. A missing file is an empty network, not an error.
pub struct HostFileDiscovery {
    path: PathBuf,
}

impl HostFileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DiscoveryAdapter for HostFileDiscovery {
    async fn discover(&self) -> AdapterResult<Vec<Observation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = tokio::fs::read(&self.path).await?;
        let observations: Vec<Observation> = serde_json::from_slice(&bytes)?;
        Ok(observations)
    }
}

/// Action sink that only logs. Tracks the last action applied per
/// device so repeated applications acknowledge as unchanged, matching
/// the idempotence contract a real firewall/DNS sink must honor.
#[derive(Default)]
pub struct LoggingSink {
    applied: Mutex<HashMap<String, Action>>,
}

impl LoggingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last action acknowledged for a device, if any
    pub fn applied_action(&self, mac: &str) -> Option<Action> {
        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(mac)
            .copied()
    }
}

#[async_trait]
impl ActionSink for LoggingSink {
    async fn apply(&self, mac: &str, action: Action, reason: BlockReason) -> AdapterResult<Ack> {
        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        let previous = applied.insert(mac.to_string(), action);
        let changed = previous != Some(action);
        if changed {
            info!("Enforcement: {} -> {} (reason: {})", mac, action, reason);
        } else {
            warn!("Enforcement no-op: {} already {}", mac, action);
        }
        Ok(Ack { changed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn logging_sink_is_idempotent() {
        let sink = LoggingSink::new();
        let first = sink
            .apply("AA:BB:CC:DD:EE:FF", Action::Block, BlockReason::ParentBlocked)
            .await
            .unwrap();
        assert!(first.changed);

        let second = sink
            .apply("AA:BB:CC:DD:EE:FF", Action::Block, BlockReason::ParentBlocked)
            .await
            .unwrap();
        assert!(!second.changed);

        let third = sink
            .apply("AA:BB:CC:DD:EE:FF", Action::Allow, BlockReason::None)
            .await
            .unwrap();
        assert!(third.changed);
    }

    #[tokio::test]
    async fn host_file_discovery_reads_observations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");

        let discovery = HostFileDiscovery::new(&path);
        assert!(discovery.discover().await.unwrap().is_empty());

        let mut obs = Observation::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)));
        obs.mac_address = Some("AA:BB:CC:DD:EE:FF".to_string());
        obs.hostname = Some("kids-ipad".to_string());
        std::fs::write(&path, serde_json::to_vec(&vec![obs]).unwrap()).unwrap();

        let seen = discovery.discover().await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].hostname.as_deref(), Some("kids-ipad"));
    }
}
