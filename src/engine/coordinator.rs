use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local, Timelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::Classifier;
use crate::config::EngineConfig;
use crate::engine::adapters::{ActionSink, AdapterError, DiscoveryAdapter};
use crate::engine::events::{channel, EngineEvent, EventPublisher};
use crate::models::device::{
    AlertSeverity, BlockReason, Device, DeviceType, OwnerCategory, SecurityAlert,
};
use crate::models::observation::Observation;
use crate::policy::engine::{PolicyEngine, PolicyError};
use crate::policy::rules::{builtin_rules, Action, PolicyRule};
use crate::registry::store::{FileStore, TrackerRecord, TRACKER_SCHEMA_VERSION};
use crate::registry::{DeviceHandle, DeviceRegistry, RegistryError};
use crate::timekeeper::{TimeBudgetTracker, TimeEvent, UsageViolation};
use crate::trust::TrustScorer;
use crate::utils::metrics;

const RESTRICTED_HOURS_ALERT: &str = "Active during restricted hours";

/// Error types surfaced by the manual control surface
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Alert {0} not found")]
    AlertNotFound(Uuid),

    #[error("Manual block requires a concrete reason")]
    MissingBlockReason,
}

/// Result type for coordinator operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Fleet-level counts for the control surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStatus {
    /// Devices the registry knows about
    pub total: usize,

    /// Seen in the latest discovery pass
    pub connected: usize,

    /// Currently blocked, for any reason
    pub blocked: usize,

    /// Current enforced action is Monitor
    pub monitored: usize,

    /// Connected and not blocked
    pub protected: usize,
}

/// Orchestrates one enforcement cycle: discovery, registry merge,
/// classification, trust scoring, rule evaluation, time ticking,
/// action application and persistence. Owns the only scheduling loop;
/// no other timer mutates engine state.
pub struct EnforcementCoordinator {
    registry: Arc<DeviceRegistry>,
    classifier: Classifier,
    scorer: TrustScorer,
    policy: RwLock<PolicyEngine>,
    tracker: TimeBudgetTracker,
    discovery: Arc<dyn DiscoveryAdapter>,
    sink: Arc<dyn ActionSink>,
    config: EngineConfig,
    events: EventPublisher,
    store: Option<Arc<FileStore>>,

    /// Last action the sink acknowledged per device; lets the cycle
    /// skip re-applying what the network layer already holds
    last_action: Mutex<HashMap<String, Action>>,

    /// Drives the minute cadence from within the single cycle loop
    last_tick: Mutex<Option<Instant>>,
}

impl EnforcementCoordinator {
    /// Build a coordinator, restoring the rule set and time-tracker
    /// extras from the store when one is given. Returns the receiving
    /// half of the event channel alongside the coordinator.
    pub async fn new(
        registry: Arc<DeviceRegistry>,
        discovery: Arc<dyn DiscoveryAdapter>,
        sink: Arc<dyn ActionSink>,
        store: Option<Arc<FileStore>>,
        config: EngineConfig,
    ) -> EngineResult<(Arc<Self>, mpsc::Receiver<EngineEvent>)> {
        let rules = match &store {
            Some(store) => match store.load_rules().await {
                Ok(Some(rules)) => {
                    info!("Restored {} policy rule(s) from disk", rules.len());
                    rules
                }
                Ok(None) => builtin_rules(config.low_trust_threshold),
                Err(e) => {
                    warn!("Failed to load rule set, starting from built-ins: {}", e);
                    builtin_rules(config.low_trust_threshold)
                }
            },
            None => builtin_rules(config.low_trust_threshold),
        };

        let tracker = TimeBudgetTracker::new(config.warn_threshold_min);
        if let Some(store) = &store {
            match store.load_tracker().await {
                Ok(Some(record)) => {
                    tracker
                        .restore(record.last_reset_date, record.entries)
                        .await;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to load tracker extras: {}", e),
            }
        }

        let (events, receiver) = channel(config.event_capacity);
        let coordinator = Arc::new(Self {
            registry,
            classifier: Classifier::new(),
            scorer: TrustScorer::new(config.trust_weights.clone()),
            policy: RwLock::new(PolicyEngine::new(rules)),
            tracker,
            discovery,
            sink,
            config,
            events,
            store,
            last_action: Mutex::new(HashMap::new()),
            last_tick: Mutex::new(None),
        });
        Ok((coordinator, receiver))
    }

    /// Run the enforcement loop until the shutdown flag flips. The
    /// in-flight cycle always finishes; the caller bounds the overall
    /// wait with `shutdown_timeout_ms`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.cycle_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Enforcement coordinator running: cycle every {}s, time tick every {}s",
            self.config.cycle_interval_secs, self.config.tick_interval_secs
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = Instant::now();
                    self.run_cycle().await;
                    metrics::record_timer("engine_cycle_duration", started.elapsed());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Let state reach disk before halting
        self.registry.save_all().await;
        self.persist_tracker().await;
        self.persist_rules().await;
        info!("Enforcement coordinator stopped");
    }

    /// One full enforcement cycle. Public so embedders and tests can
    /// drive the engine without the timer.
    pub async fn run_cycle(&self) {
        metrics::increment_counter("engine_cycles_total");
        let now = Utc::now();
        let local = Local::now();
        let minute_of_day = (local.hour() * 60 + local.minute()) as u16;

        // Daily reset first, guarded by the date marker so a process
        // that slept through midnight still resets exactly once
        let devices = self.registry.all().await;
        if self
            .tracker
            .reset_daily_if_needed(local.date_naive(), &devices)
            .await
        {
            self.persist_tracker().await;
            self.registry.save_all().await;
        }

        let observations = self.discover(now).await;

        let tick_due = self.tick_due().await;
        for handle in self.registry.all().await {
            let mac = handle.read().await.mac_address.clone();
            if let Err(e) = self
                .process_device(&handle, &observations, now, minute_of_day, tick_due)
                .await
            {
                // Partial-failure isolation: one bad device never
                // aborts the cycle for the rest
                error!("Cycle failed for device {}: {}", mac, e);
            }
        }

        if tick_due {
            self.persist_tracker().await;
        }
    }

    /// Pull observations, merge into the registry and flag absentees.
    /// On discovery failure every device simply keeps its prior state.
    async fn discover(&self, now: DateTime<Utc>) -> HashMap<String, Observation> {
        let mut by_mac = HashMap::new();
        let budget = Duration::from_millis(self.config.discovery_timeout_ms);

        let observations = match timeout(budget, self.discovery.discover()).await {
            Ok(Ok(observations)) => observations,
            Ok(Err(e)) => {
                warn!("Discovery failed, keeping prior device state: {}", e);
                metrics::increment_counter("engine_discovery_failures_total");
                return by_mac;
            }
            Err(_) => {
                warn!(
                    "Discovery timed out after {} ms, keeping prior device state",
                    self.config.discovery_timeout_ms
                );
                metrics::increment_counter("engine_discovery_failures_total");
                return by_mac;
            }
        };

        let mut seen = HashSet::new();
        for observation in observations {
            metrics::increment_counter("engine_observations_total");
            match self.registry.upsert(&observation, now).await {
                Ok((handle, created)) => {
                    let mac = handle.read().await.mac_address.clone();
                    if created {
                        metrics::increment_counter("engine_devices_discovered_total");
                        self.events
                            .publish(EngineEvent::DeviceDiscovered { mac: mac.clone() });
                    }
                    seen.insert(mac.clone());
                    by_mac.insert(mac, observation);
                }
                Err(e) => {
                    // MAC-less or malformed sightings are dropped, not fatal
                    debug!("Skipping observation from {}: {}", observation.ip_address, e);
                }
            }
        }
        self.registry.mark_absent(&seen).await;
        by_mac
    }

    async fn tick_due(&self) -> bool {
        let mut last_tick = self.last_tick.lock().await;
        let due = match *last_tick {
            None => true,
            Some(at) => at.elapsed() >= std::time::Duration::from_secs(self.config.tick_interval_secs),
        };
        if due {
            *last_tick = Some(Instant::now());
        }
        due
    }

    /// Classify, score, evaluate and enforce one device
    async fn process_device(
        &self,
        handle: &DeviceHandle,
        observations: &HashMap<String, Observation>,
        now: DateTime<Utc>,
        minute_of_day: u16,
        tick_due: bool,
    ) -> EngineResult<()> {
        let mut device = handle.write().await;
        if !device.is_connected {
            return Ok(());
        }

        if device.device_type == DeviceType::Unknown
            || device.owner_category == OwnerCategory::Unknown
        {
            self.classify_device(&mut device, observations);
        }

        device.trust_score = self.scorer.score(&device, now);

        let verdict = self.policy.read().await.evaluate(&device, minute_of_day);

        // Rule-driven blocks are owned by the cycle: set while the rule
        // set says Block, lifted as soon as it stops. Manual and
        // time-limit blocks are never touched here.
        if verdict.action == Action::Block {
            if !device.is_blocked {
                device.block(BlockReason::PolicyBlocked);
                info!(
                    "Device {} blocked by rule {}",
                    device.mac_address,
                    verdict.rule_id.as_deref().unwrap_or("?")
                );
            }
        } else if device.block_reason == BlockReason::PolicyBlocked {
            device.unblock();
            info!("Device {} released: blocking rule no longer matches", device.mac_address);
        }

        let mut time_action = Action::Allow;
        if tick_due {
            let mac = device.mac_address.clone();
            for event in self.tracker.tick(&mut device, now, minute_of_day).await {
                match event {
                    TimeEvent::Warning { remaining_min } => {
                        metrics::increment_counter("engine_time_warnings_total");
                        self.events.publish(EngineEvent::Warning {
                            mac: mac.clone(),
                            remaining_min,
                        });
                    }
                    TimeEvent::LimitExceeded => {
                        metrics::increment_counter("engine_time_limit_blocks_total");
                        time_action = Action::Block;
                        self.events
                            .publish(EngineEvent::LimitExceeded { mac: mac.clone() });
                    }
                    TimeEvent::RestrictedAccess => {
                        // A notification, deliberately not a block; one
                        // alert per episode, not one per tick
                        let already_flagged = device
                            .alerts
                            .iter()
                            .any(|a| !a.resolved && a.description == RESTRICTED_HOURS_ALERT);
                        if !already_flagged {
                            device.push_alert(SecurityAlert::new(
                                AlertSeverity::Medium,
                                RESTRICTED_HOURS_ALERT,
                                now,
                            ));
                        }
                        self.events
                            .publish(EngineEvent::RestrictedTimeAccess { mac: mac.clone() });
                    }
                }
            }
        }

        // The more restrictive of the two paths wins; an existing block
        // of any origin stays a Block at the network layer
        let mut action = verdict.action.max(time_action);
        if device.is_blocked {
            action = Action::Block;
        }

        let snapshot = device.clone();
        drop(device);

        self.apply_action(&snapshot.mac_address, action, snapshot.block_reason)
            .await;

        // The in-memory decision already reached the sink; a failed
        // write is retried next cycle rather than rolled back
        if let Err(e) = self.registry.save(&snapshot).await {
            warn!(
                "Persisting device {} failed, retrying next cycle: {}",
                snapshot.mac_address, e
            );
        }
        Ok(())
    }

    fn classify_device(&self, device: &mut Device, observations: &HashMap<String, Observation>) {
        let observation = observations
            .get(&device.mac_address)
            .cloned()
            .unwrap_or_else(|| {
                // No fresh sighting this cycle; classify from stored fields
                let mut obs = Observation::new(device.ip_address.unwrap_or([0, 0, 0, 0].into()));
                obs.hostname = device.hostname.clone();
                obs
            });

        // Each axis only ever moves away from Unknown; a hostname that
        // identifies the type must not erase an already-known owner
        let classification = self.classifier.classify(&observation);
        if classification.device_type != DeviceType::Unknown {
            device.device_type = classification.device_type;
        }
        if classification.owner_category != OwnerCategory::Unknown {
            device.owner_category = classification.owner_category;
        }
        if device.device_type != DeviceType::Unknown
            || device.owner_category != OwnerCategory::Unknown
        {
            debug!(
                "Classified {} as {} / {:?}",
                device.mac_address, device.device_type, device.owner_category
            );
        }
    }

    /// Push a decision to the action sink unless the sink already
    /// holds it. Failures leave the recorded state untouched so the
    /// next cycle retries.
    async fn apply_action(&self, mac: &str, action: Action, reason: BlockReason) {
        {
            let last = self.last_action.lock().await;
            if last.get(mac) == Some(&action) {
                return;
            }
        }

        let budget = Duration::from_millis(self.config.sink_timeout_ms);
        let outcome = match timeout(budget, self.sink.apply(mac, action, reason)).await {
            Ok(Ok(_ack)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(AdapterError::Timeout(self.config.sink_timeout_ms).to_string()),
        };

        match outcome {
            Ok(()) => {
                metrics::increment_counter("engine_actions_applied_total");
                self.last_action
                    .lock()
                    .await
                    .insert(mac.to_string(), action);
                self.events.publish(EngineEvent::ActionApplied {
                    mac: mac.to_string(),
                    action,
                });
            }
            Err(error) => {
                metrics::increment_counter("engine_action_failures_total");
                warn!("Action sink failed for {} ({}): {}", mac, action, error);
                self.events.publish(EngineEvent::ActionFailed {
                    mac: mac.to_string(),
                    action,
                    error,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Manual control surface. These bypass the cycle, take the same
    // per-device lock it does, apply immediately and persist.
    // ------------------------------------------------------------------

    /// Block a device right now with an explicit reason
    pub async fn block_device(&self, mac: &str, reason: BlockReason) -> EngineResult<()> {
        if reason == BlockReason::None {
            return Err(EngineError::MissingBlockReason);
        }
        let handle = self.registry.require(mac).await?;
        let snapshot = {
            let mut device = handle.write().await;
            device.block(reason);
            device.clone()
        };
        self.apply_action(mac, Action::Block, reason).await;
        self.registry.save(&snapshot).await?;
        info!("Device {} manually blocked ({})", mac, reason);
        Ok(())
    }

    /// Lift a block right now
    pub async fn unblock_device(&self, mac: &str) -> EngineResult<()> {
        let handle = self.registry.require(mac).await?;
        let snapshot = {
            let mut device = handle.write().await;
            device.unblock();
            device.clone()
        };
        self.apply_action(mac, Action::Allow, BlockReason::None).await;
        self.registry.save(&snapshot).await?;
        info!("Device {} manually unblocked", mac);
        Ok(())
    }

    /// Change a device's daily allowance
    pub async fn set_time_limit(&self, mac: &str, minutes: u32) -> EngineResult<()> {
        let handle = self.registry.require(mac).await?;
        let snapshot = {
            let mut device = handle.write().await;
            device.daily_limit_min = minutes;
            device.clone()
        };
        self.registry.save(&snapshot).await?;
        Ok(())
    }

    /// Grant extra minutes today; immediately unblocks a device that
    /// was blocked for exhausting its budget
    pub async fn grant_extra_time(
        &self,
        mac: &str,
        minutes: u32,
        reason: &str,
    ) -> EngineResult<()> {
        let handle = self.registry.require(mac).await?;
        let snapshot = {
            let mut device = handle.write().await;
            self.tracker
                .grant_extra_time(&mut device, minutes, reason)
                .await;
            device.clone()
        };
        if !snapshot.is_blocked {
            self.apply_action(mac, Action::Allow, BlockReason::None).await;
        }
        self.registry.save(&snapshot).await?;
        self.persist_tracker().await;
        Ok(())
    }

    /// Exempt (or re-subject) a device from time-budget enforcement
    pub async fn set_always_on(&self, mac: &str, always_on: bool) -> EngineResult<()> {
        let handle = self.registry.require(mac).await?;
        let snapshot = {
            let mut device = handle.write().await;
            device.always_on = always_on;
            device.clone()
        };
        self.registry.save(&snapshot).await?;
        Ok(())
    }

    /// Suspend time ticking for a device until the given instant
    pub async fn pause_device(&self, mac: &str, until: DateTime<Utc>) -> EngineResult<()> {
        self.registry.require(mac).await?;
        self.tracker.pause(mac, until).await;
        self.persist_tracker().await;
        Ok(())
    }

    /// Mark a security alert reviewed
    pub async fn resolve_alert(&self, mac: &str, alert_id: Uuid) -> EngineResult<()> {
        let handle = self.registry.require(mac).await?;
        let snapshot = {
            let mut device = handle.write().await;
            if !device.resolve_alert(alert_id) {
                return Err(EngineError::AlertNotFound(alert_id));
            }
            device.clone()
        };
        self.registry.save(&snapshot).await?;
        Ok(())
    }

    /// Add a user policy rule; conflicts surface here, never during
    /// evaluation
    pub async fn add_rule(&self, rule: PolicyRule) -> EngineResult<()> {
        self.policy.write().await.add_rule(rule)?;
        self.persist_rules().await;
        Ok(())
    }

    /// Toggle any rule's activation flag (the only mutation built-ins
    /// allow)
    pub async fn set_rule_active(&self, rule_id: &str, active: bool) -> EngineResult<()> {
        self.policy.write().await.set_active(rule_id, active)?;
        self.persist_rules().await;
        Ok(())
    }

    /// Delete a user rule; built-ins can only be deactivated
    pub async fn remove_rule(&self, rule_id: &str) -> EngineResult<()> {
        self.policy.write().await.remove_rule(rule_id)?;
        self.persist_rules().await;
        Ok(())
    }

    /// Snapshot of the active rule set
    pub async fn rules(&self) -> Vec<PolicyRule> {
        self.policy.read().await.rules().to_vec()
    }

    /// Recorded time-policy violations for a device
    pub async fn violations(&self, mac: &str) -> Vec<UsageViolation> {
        self.tracker.violations(mac).await
    }

    /// Fleet-level counts
    pub async fn status(&self) -> AggregateStatus {
        let mut status = AggregateStatus::default();
        let last_action = self.last_action.lock().await;
        for handle in self.registry.all().await {
            let device = handle.read().await;
            status.total += 1;
            if device.is_connected {
                status.connected += 1;
            }
            if device.is_blocked {
                status.blocked += 1;
            } else if device.is_connected {
                status.protected += 1;
            }
            if device.is_connected && last_action.get(&device.mac_address) == Some(&Action::Monitor)
            {
                status.monitored += 1;
            }
        }
        status
    }

    async fn persist_tracker(&self) {
        if let Some(store) = &self.store {
            let (last_reset_date, entries) = self.tracker.export().await;
            let record = TrackerRecord {
                schema_version: TRACKER_SCHEMA_VERSION,
                last_reset_date,
                entries,
            };
            if let Err(e) = store.save_tracker(&record).await {
                warn!("Persisting tracker extras failed, retrying next cycle: {}", e);
            }
        }
    }

    async fn persist_rules(&self) {
        if let Some(store) = &self.store {
            let rules = self.policy.read().await.rules().to_vec();
            if let Err(e) = store.save_rules(&rules).await {
                warn!("Persisting rule set failed, retrying next change: {}", e);
            }
        }
    }
}
