use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use netguard::config::EngineConfig;
use netguard::engine::adapters::{Ack, ActionSink, AdapterError, AdapterResult, DiscoveryAdapter};
use netguard::engine::coordinator::EnforcementCoordinator;
use netguard::models::device::{BlockReason, DeviceType, OwnerCategory};
use netguard::models::observation::Observation;
use netguard::policy::rules::{Action, Clause, PolicyRule, Predicate};
use netguard::registry::store::FileStore;
use netguard::registry::DeviceRegistry;

struct FixedDiscovery {
    observations: Vec<Observation>,
}

#[async_trait]
impl DiscoveryAdapter for FixedDiscovery {
    async fn discover(&self) -> AdapterResult<Vec<Observation>> {
        Ok(self.observations.clone())
    }
}

#[derive(Default)]
struct CountingSink {
    calls: Mutex<Vec<(String, Action)>>,
}

#[async_trait]
impl ActionSink for CountingSink {
    async fn apply(&self, mac: &str, action: Action, _reason: BlockReason) -> AdapterResult<Ack> {
        self.calls
            .lock()
            .map_err(|e| AdapterError::Failed(e.to_string()))?
            .push((mac.to_string(), action));
        Ok(Ack { changed: true })
    }
}

fn observation(ip: u8, mac: &str, hostname: &str) -> Observation {
    let mut obs = Observation::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, ip)));
    obs.mac_address = Some(mac.to_string());
    obs.hostname = Some(hostname.to_string());
    obs
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.metrics_addr = None;
    config
}

async fn build_engine(
    store: Arc<FileStore>,
    observations: Vec<Observation>,
) -> (Arc<EnforcementCoordinator>, Arc<CountingSink>) {
    let registry = Arc::new(
        DeviceRegistry::with_store(store.clone(), 480)
            .await
            .unwrap(),
    );
    let discovery = Arc::new(FixedDiscovery { observations });
    let sink = Arc::new(CountingSink::default());
    let (coordinator, _events) = EnforcementCoordinator::new(
        registry,
        discovery,
        sink.clone(),
        Some(store),
        config(),
    )
    .await
    .unwrap();
    (coordinator, sink)
}

#[tokio::test]
async fn full_cycle_classifies_enforces_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());

    let (engine, sink) = build_engine(
        store.clone(),
        vec![
            observation(10, "AA:BB:CC:DD:EE:01", "kids-ipad"),
            observation(11, "AA:BB:CC:DD:EE:02", "garage-widget"),
        ],
    )
    .await;

    engine.run_cycle().await;

    let calls = sink.calls.lock().unwrap().clone();
    assert!(calls.contains(&("AA:BB:CC:DD:EE:01".to_string(), Action::Allow)));
    assert!(calls.contains(&("AA:BB:CC:DD:EE:02".to_string(), Action::Block)));

    // Everything the cycle decided reached disk
    let devices = store.load_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    let widget = devices
        .iter()
        .find(|d| d.mac_address == "AA:BB:CC:DD:EE:02")
        .unwrap();
    assert!(widget.is_blocked);
    assert_eq!(widget.block_reason, BlockReason::PolicyBlocked);
}

#[tokio::test]
async fn profiles_rules_and_blocks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());

    {
        let (engine, _sink) = build_engine(
            store.clone(),
            vec![observation(10, "AA:BB:CC:DD:EE:01", "kids-ipad")],
        )
        .await;
        engine.run_cycle().await;

        engine
            .add_rule(PolicyRule::new(
                "no-guests-at-night",
                5,
                Predicate::new(vec![Clause::OwnerIs(OwnerCategory::Guest)]),
                Action::Block,
            ))
            .await
            .unwrap();
        engine
            .block_device("AA:BB:CC:DD:EE:01", BlockReason::ParentBlocked)
            .await
            .unwrap();
    }

    // Fresh engine on the same data directory
    let (engine, sink) = build_engine(
        store.clone(),
        vec![observation(10, "AA:BB:CC:DD:EE:01", "kids-ipad")],
    )
    .await;

    let rules = engine.rules().await;
    assert!(rules.iter().any(|r| r.id == "no-guests-at-night"));

    engine.run_cycle().await;

    let handle = engine.status().await;
    assert_eq!(handle.total, 1);
    assert_eq!(handle.blocked, 1);

    // Parent block survives the restart and the cycle re-applies it
    let calls = sink.calls.lock().unwrap().clone();
    assert!(calls.contains(&("AA:BB:CC:DD:EE:01".to_string(), Action::Block)));

    let devices = store.load_devices().await.unwrap();
    let ipad = devices
        .iter()
        .find(|d| d.mac_address == "AA:BB:CC:DD:EE:01")
        .unwrap();
    assert_eq!(ipad.device_type, DeviceType::Tablet);
    assert_eq!(ipad.owner_category, OwnerCategory::Child);
    assert_eq!(ipad.block_reason, BlockReason::ParentBlocked);
}

#[tokio::test]
async fn absent_devices_are_kept_but_marked_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());

    {
        let (engine, _sink) = build_engine(
            store.clone(),
            vec![
                observation(10, "AA:BB:CC:DD:EE:01", "kids-ipad"),
                observation(11, "AA:BB:CC:DD:EE:02", "dads-iphone"),
            ],
        )
        .await;
        engine.run_cycle().await;
    }

    // Next run the phone has left the network
    let (engine, _sink) = build_engine(
        store.clone(),
        vec![observation(10, "AA:BB:CC:DD:EE:01", "kids-ipad")],
    )
    .await;
    engine.run_cycle().await;

    let status = engine.status().await;
    assert_eq!(status.total, 2);
    assert_eq!(status.connected, 1);
}

#[tokio::test]
async fn granted_minutes_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());

    {
        let (engine, _sink) = build_engine(
            store.clone(),
            vec![observation(10, "AA:BB:CC:DD:EE:01", "kids-ipad")],
        )
        .await;
        engine.run_cycle().await;
        engine
            .grant_extra_time("AA:BB:CC:DD:EE:01", 30, "homework")
            .await
            .unwrap();
    }

    let record = store.load_tracker().await.unwrap().unwrap();
    let (_, entry) = record
        .entries
        .iter()
        .find(|(mac, _)| mac == "AA:BB:CC:DD:EE:01")
        .unwrap();
    assert_eq!(entry.extra_min, 30);
    assert_eq!(entry.extra_reason.as_deref(), Some("homework"));
}
