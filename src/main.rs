use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use netguard::config::EngineConfig;
use netguard::engine::adapters::{HostFileDiscovery, LoggingSink};
use netguard::engine::coordinator::EnforcementCoordinator;
use netguard::engine::events::EngineEvent;
use netguard::registry::store::FileStore;
use netguard::registry::DeviceRegistry;
use netguard::utils::{logging, metrics};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    let config = EngineConfig::from_env();

    if let Err(e) = logging::init_logging("info", config.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    metrics::init(config.metrics_addr.is_some());
    if let Err(e) = metrics::register_engine_metrics() {
        warn!("Failed to register engine metrics: {}", e);
    }
    if let Some(addr) = config.metrics_addr {
        match metrics::start_server(addr).await {
            Ok(()) => info!("Metrics server started on {}", addr),
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    let store = match FileStore::open(&config.data_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                "Cannot open data directory {}: {}",
                config.data_dir.display(),
                e
            );
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    let registry =
        match DeviceRegistry::with_store(store.clone(), config.default_daily_limit_min).await {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                error!("Failed to load device registry: {}", e);
                return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
            }
        };

    // External tools drop the current host table here; a firewall sink
    // slots in behind the same trait once one exists
    let discovery = Arc::new(HostFileDiscovery::new(config.data_dir.join("hosts.json")));
    let sink = Arc::new(LoggingSink::new());

    let (coordinator, mut events) = match EnforcementCoordinator::new(
        registry,
        discovery,
        sink,
        Some(store),
        config.clone(),
    )
    .await
    {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to initialize enforcement engine: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };

    // Surface engine events in the log until a real notifier exists
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::DeviceDiscovered { mac } => {
                    info!("New device on the network: {}", mac)
                }
                EngineEvent::Warning { mac, remaining_min } => {
                    info!("{} has {} minute(s) of screen time left", mac, remaining_min)
                }
                EngineEvent::LimitExceeded { mac } => {
                    info!("{} exhausted today's screen time", mac)
                }
                EngineEvent::RestrictedTimeAccess { mac } => {
                    warn!("{} is active during restricted hours", mac)
                }
                EngineEvent::ActionApplied { mac, action } => {
                    info!("Enforcement applied: {} -> {}", mac, action)
                }
                EngineEvent::ActionFailed { mac, action, error } => {
                    warn!("Enforcement failed: {} -> {} ({})", mac, action, error)
                }
            }
        }
    });

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(coordinator.run(shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested, finishing the in-flight cycle");
    let _ = shutdown_tx.send(true);

    match timeout(Duration::from_millis(config.shutdown_timeout_ms), engine).await {
        Ok(Ok(())) => info!("Engine stopped cleanly"),
        Ok(Err(e)) => error!("Engine task failed: {}", e),
        Err(_) => warn!(
            "Engine did not stop within {} ms, exiting anyway",
            config.shutdown_timeout_ms
        ),
    }

    Ok(())
}

/// Print a startup summary of where everything lives
fn print_startup_banner(config: &EngineConfig) {
    println!("\n{}", "═".repeat(72));
    println!(
        "  {}",
        console::style("NETGUARD DEVICE POLICY ENGINE").cyan().bold()
    );
    println!("{}", "═".repeat(72));
    println!("  Data directory : {}", config.data_dir.display());
    println!(
        "  Host table     : {}",
        config.data_dir.join("hosts.json").display()
    );
    if let Some(addr) = config.metrics_addr {
        println!("  Metrics        : http://{}/metrics", addr);
    }
    println!("{}", "═".repeat(72));
}
