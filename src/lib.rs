// Module declarations for the application's core components
pub mod channels;        // Inter-component communication channels
pub mod config;          // Configuration management
pub mod encoder;         // Telemetry -> register encoding
pub mod engine;          // Shared meter state
pub mod ingest;          // MQTT messages -> engine
pub mod modbus_server;   // Modbus/TCP polling responder
pub mod mqtt;            // MQTT client
pub mod options;         // Command line options parsing
pub mod prelude;         // Common imports and types
pub mod register_table;  // Emulated meter address space
pub mod sample_store;    // Latest telemetry values
pub mod scheduler;       // Periodic encoder task

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::ingest::Ingest;
use crate::modbus_server::PollingResponder;
use crate::mqtt::Mqtt;
use crate::scheduler::Scheduler;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Installs the global logger.
///
/// With `RUST_LOG` set, its filter decides and `level` is ignored. Otherwise
/// the logger lets everything through and the effective level is `level`
/// until `set_log_level` changes it once the config is loaded.
pub fn init_logging(level: &str) {
    // a second call (tests) keeps the first logger
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    set_log_level(level);
}

/// Applies the configured level, unless `RUST_LOG` already chose one.
pub fn set_log_level(level: &str) {
    if let Some(filter) = configured_level(level, std::env::var_os("RUST_LOG").is_some()) {
        log::set_max_level(filter);
    }
}

fn configured_level(level: &str, rust_log_set: bool) -> Option<log::LevelFilter> {
    if rust_log_set {
        debug!("RUST_LOG is set, ignoring loglevel {:?}", level);
        return None;
    }

    match level.parse::<log::LevelFilter>() {
        Ok(filter) => Some(filter),
        Err(_) => {
            warn!("unknown log level {:?}, keeping {}", level, log::max_level());
            None
        }
    }
}

/// Main application entry point
///
/// Starts ingest, MQTT and the encoder straight away; the Modbus server only
/// comes up once real energy data has arrived. Runs until `shutdown_rx` fires
/// or one of the tasks fails.
pub async fn app(
    mut shutdown_rx: broadcast::Receiver<()>,
    config: Arc<ConfigWrapper>,
) -> Result<()> {
    set_log_level(&config.loglevel());

    info!("fronius-meter-bridge {} starting", CARGO_PKG_VERSION);

    let channels = Channels::new();
    let engine = Arc::new(Engine::from_config(&config)?);

    info!("Initializing components...");

    // subscribe before mqtt starts so no message is missed
    let ingest = Arc::new(Ingest::new(engine.clone(), channels.clone()));
    let receiver = ingest.subscribe();
    let ingest_handle = {
        let ingest = ingest.clone();
        tokio::spawn(async move { ingest.start(receiver).await })
    };

    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        channels.clone(),
        config.meter().update_interval(),
    ));
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.start().await })
    };

    let mqtt = Mqtt::new((*config).clone(), channels.clone(), engine.topics());
    let mqtt_handle = {
        let mqtt = mqtt.clone();
        tokio::spawn(async move { mqtt.start().await })
    };

    let modbus = config.modbus();
    let responder = PollingResponder::new(engine.clone(), modbus.unit_id());
    let addr = modbus.socket_addr()?;

    let result = tokio::select! {
        r = async {
            futures::try_join!(
                join(ingest_handle, "ingest"),
                join(scheduler_handle, "scheduler"),
                join(mqtt_handle, "mqtt"),
                responder.start(addr)
            )
        } => r.map(|_| ()),
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, stopping components...");
            Ok(())
        }
    };

    mqtt.stop();
    scheduler.stop();
    ingest.stop();

    engine.stats().print_summary();
    info!("Application shutdown complete");

    result
}

// a task that ends early takes the whole bridge down with it
async fn join(handle: JoinHandle<Result<()>>, name: &str) -> Result<()> {
    match handle.await {
        Ok(result) => result.map_err(|e| anyhow!("{} task failed: {}", name, e)),
        Err(e) => bail!("Error waiting for {} task: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_config_level() {
        assert_eq!(configured_level("debug", false), Some(log::LevelFilter::Debug));
        assert_eq!(configured_level("WARN", false), Some(log::LevelFilter::Warn));
        assert_eq!(configured_level("chatty", false), None);

        assert_eq!(configured_level("error", true), None);
    }
}
