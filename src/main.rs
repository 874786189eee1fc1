use std::sync::Arc;

use fronius_meter_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    fronius_meter_bridge::init_logging("info");

    let config = ConfigWrapper::new(options.config_file).unwrap_or_else(|err| {
        error!("Failed to load config: {:?}", err);
        std::process::exit(255);
    });

    // Create a channel for shutdown signaling
    let (shutdown_tx, _) = broadcast::channel(1);

    // Handle Ctrl+C
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        if let Err(e) = shutdown_tx_clone.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    if let Err(e) = fronius_meter_bridge::app(shutdown_tx.subscribe(), Arc::new(config)).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}
