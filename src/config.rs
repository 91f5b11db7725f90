use std::net::SocketAddr;
use std::path::PathBuf;

use crate::trust::TrustWeights;

/// Engine configuration. Defaults are the shipped tuning; every knob
/// can be overridden through `NETGUARD_*` environment variables (see
/// `from_env`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Discovery + policy cadence in seconds
    pub cycle_interval_secs: u64,

    /// Time-budget tick cadence in seconds
    pub tick_interval_secs: u64,

    /// Budget for one discovery pass
    pub discovery_timeout_ms: u64,

    /// Budget for one action-sink call
    pub sink_timeout_ms: u64,

    /// How long a clean stop may wait for an in-flight cycle
    pub shutdown_timeout_ms: u64,

    /// Remaining-minutes band that triggers the low-time warning
    pub warn_threshold_min: u32,

    /// Daily allowance for newly discovered devices
    pub default_daily_limit_min: u32,

    /// Trust score below which the built-in restrict rule fires
    pub low_trust_threshold: f64,

    /// Trust scorer weights
    pub trust_weights: TrustWeights,

    /// Where device/rule/tracker records live
    pub data_dir: PathBuf,

    /// Metrics HTTP endpoint, None to disable
    pub metrics_addr: Option<SocketAddr>,

    /// Append-mode log file, None for stdout only
    pub log_file: Option<PathBuf>,

    /// Event channel capacity; events past this are dropped, never
    /// allowed to stall a cycle
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 30,
            tick_interval_secs: 60,
            discovery_timeout_ms: 5_000,
            sink_timeout_ms: 3_000,
            shutdown_timeout_ms: 10_000,
            warn_threshold_min: 15,
            default_daily_limit_min: 8 * 60,
            low_trust_threshold: 0.3,
            trust_weights: TrustWeights::default(),
            data_dir: PathBuf::from("netguard-data"),
            metrics_addr: "0.0.0.0:9091".parse().ok(),
            log_file: Some(PathBuf::from("netguard.log")),
            event_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u64>("NETGUARD_CYCLE_INTERVAL_SECS") {
            config.cycle_interval_secs = v;
        }
        if let Some(v) = env_parse::<u64>("NETGUARD_TICK_INTERVAL_SECS") {
            config.tick_interval_secs = v;
        }
        if let Some(v) = env_parse::<u64>("NETGUARD_DISCOVERY_TIMEOUT_MS") {
            config.discovery_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("NETGUARD_SINK_TIMEOUT_MS") {
            config.sink_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u32>("NETGUARD_WARN_THRESHOLD_MIN") {
            config.warn_threshold_min = v;
        }
        if let Some(v) = env_parse::<u32>("NETGUARD_DEFAULT_DAILY_LIMIT_MIN") {
            config.default_daily_limit_min = v;
        }
        if let Some(v) = env_parse::<f64>("NETGUARD_LOW_TRUST_THRESHOLD") {
            config.low_trust_threshold = v;
        }
        if let Ok(v) = std::env::var("NETGUARD_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NETGUARD_METRICS_ADDR") {
            // "off" disables the endpoint entirely
            config.metrics_addr = if v == "off" { None } else { v.parse().ok() };
        }
        if let Ok(v) = std::env::var("NETGUARD_LOG_FILE") {
            // same "off" convention as the metrics endpoint
            config.log_file = if v == "off" { None } else { Some(PathBuf::from(v)) };
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
