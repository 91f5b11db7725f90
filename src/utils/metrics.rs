use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::info;
use warp::Filter;

/// Metrics errors
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics not initialized")]
    NotInitialized,
}

/// Result type for metrics operations
type MetricsResult<T> = Result<T, MetricsError>;

/// Atomic counter for metrics
#[derive(Debug)]
struct Counter {
    value: AtomicU64,
    description: String,
}

impl Counter {
    fn new(description: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            description: description.to_string(),
        }
    }

    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn add(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Timer for measuring durations
#[derive(Debug)]
struct Timer {
    count: AtomicU64,
    sum: AtomicU64, // in nanoseconds
    min: AtomicU64, // in nanoseconds
    max: AtomicU64, // in nanoseconds
    description: String,
}

impl Timer {
    fn new(description: &str) -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            description: description.to_string(),
        }
    }

    fn record(&self, duration: Duration) {
        let nanos = duration.as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(nanos, Ordering::Relaxed);
        self.min.fetch_min(nanos, Ordering::Relaxed);
        self.max.fetch_max(nanos, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn min_ms(&self) -> u64 {
        let min = self.min.load(Ordering::Relaxed);
        if min == u64::MAX {
            0
        } else {
            min / 1_000_000
        }
    }

    fn max_ms(&self) -> u64 {
        self.max.load(Ordering::Relaxed) / 1_000_000
    }

    fn avg_ms(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            0
        } else {
            self.sum.load(Ordering::Relaxed) / count / 1_000_000
        }
    }
}

/// Metrics registry. Incrementing is a read lock plus a relaxed atomic
/// add; unknown names register themselves on first touch so call sites
/// never have to care about setup order.
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    timers: RwLock<HashMap<String, Arc<Timer>>>,
    enabled: AtomicBool,
}

impl MetricsRegistry {
    fn new(enabled: bool) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    fn register_counter(&self, name: &str, description: &str) -> Arc<Counter> {
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(|e| e.into_inner());
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::new(description)))
            .clone()
    }

    fn register_timer(&self, name: &str, description: &str) -> Arc<Timer> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        timers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Timer::new(description)))
            .clone()
    }

    fn counter(&self, name: &str) -> Arc<Counter> {
        {
            let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
            if let Some(counter) = counters.get(name) {
                return counter.clone();
            }
        }
        self.register_counter(name, "")
    }

    fn timer(&self, name: &str) -> Arc<Timer> {
        {
            let timers = self.timers.read().unwrap_or_else(|e| e.into_inner());
            if let Some(timer) = timers.get(name) {
                return timer.clone();
            }
        }
        self.register_timer(name, "")
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn collect_metrics(&self) -> Metrics {
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        let timers = self.timers.read().unwrap_or_else(|e| e.into_inner());

        let mut counter_metrics: Vec<CounterMetric> = counters
            .iter()
            .map(|(name, counter)| CounterMetric {
                name: name.clone(),
                value: counter.value(),
                description: counter.description.clone(),
            })
            .collect();
        counter_metrics.sort_by(|a, b| a.name.cmp(&b.name));

        let mut timer_metrics: Vec<TimerMetric> = timers
            .iter()
            .map(|(name, timer)| TimerMetric {
                name: name.clone(),
                count: timer.count(),
                min_ms: timer.min_ms(),
                max_ms: timer.max_ms(),
                avg_ms: timer.avg_ms(),
                description: timer.description.clone(),
            })
            .collect();
        timer_metrics.sort_by(|a, b| a.name.cmp(&b.name));

        Metrics {
            counters: counter_metrics,
            timers: timer_metrics,
        }
    }
}

/// Global metrics registry
static METRICS: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Initialize the metrics system
pub fn init(enabled: bool) -> Arc<MetricsRegistry> {
    let registry = Arc::new(MetricsRegistry::new(enabled));
    let _ = METRICS.set(registry.clone());
    registry
}

/// Get the global metrics registry
pub fn registry() -> MetricsResult<Arc<MetricsRegistry>> {
    METRICS.get().cloned().ok_or(MetricsError::NotInitialized)
}

/// Counter metric for JSON serialization
#[derive(Serialize, Debug)]
pub struct CounterMetric {
    pub name: String,
    pub value: u64,
    pub description: String,
}

/// Timer metric for JSON serialization
#[derive(Serialize, Debug)]
pub struct TimerMetric {
    pub name: String,
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub description: String,
}

/// Complete metrics structure for JSON serialization
#[derive(Serialize, Debug)]
pub struct Metrics {
    pub counters: Vec<CounterMetric>,
    pub timers: Vec<TimerMetric>,
}

/// Start a metrics HTTP server
pub async fn start_server(addr: SocketAddr) -> MetricsResult<()> {
    let registry = registry()?;

    let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || {
        let registry = registry.clone();
        async move {
            Ok::<_, warp::Rejection>(warp::reply::json(&registry.collect_metrics()))
        }
    });

    let health_route = warp::path("health").and(warp::get()).map(|| "OK");

    let routes = metrics_route.or(health_route);

    info!("Metrics server listening on http://{}/metrics", addr);
    tokio::spawn(async move {
        warp::serve(routes).run(addr).await;
    });

    Ok(())
}

/// Bump a counter by one; a no-op before `init`
pub fn increment_counter(name: &str) {
    if let Some(registry) = METRICS.get() {
        if registry.is_enabled() {
            registry.counter(name).increment();
        }
    }
}

/// Bump a counter by an arbitrary amount; a no-op before `init`
pub fn add_to_counter(name: &str, value: u64) {
    if let Some(registry) = METRICS.get() {
        if registry.is_enabled() {
            registry.counter(name).add(value);
        }
    }
}

/// Record a duration sample; a no-op before `init`
pub fn record_timer(name: &str, duration: Duration) {
    if let Some(registry) = METRICS.get() {
        if registry.is_enabled() {
            registry.timer(name).record(duration);
        }
    }
}

/// Engine metrics registration, so the endpoint carries descriptions
/// before the first cycle touches anything
pub fn register_engine_metrics() -> MetricsResult<()> {
    let registry = registry()?;

    registry.register_counter("engine_cycles_total", "Enforcement cycles completed");
    registry.register_counter("engine_observations_total", "Raw discovery observations processed");
    registry.register_counter("engine_devices_discovered_total", "Devices seen for the first time");
    registry.register_counter("engine_discovery_failures_total", "Discovery passes that failed or timed out");
    registry.register_counter("engine_actions_applied_total", "Enforcement actions acknowledged by the sink");
    registry.register_counter("engine_action_failures_total", "Action sink calls that failed or timed out");
    registry.register_counter("engine_time_warnings_total", "Low-remaining-time warnings raised");
    registry.register_counter("engine_time_limit_blocks_total", "Devices auto-blocked for exhausting their budget");

    registry.register_timer("engine_cycle_duration", "Wall time of one enforcement cycle");

    Ok(())
}
