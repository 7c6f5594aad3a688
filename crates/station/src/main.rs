//! Expo Station - Main Entry Point
//!
//! Clocks a reference worker in with the dispatcher and serves orders until
//! the dispatcher ends the shift or the process is interrupted.

use anyhow::Context;
use expo_common::{ExpoConfig, ExpoError};
use expo_station::Station;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("EXPO_CONFIG") {
        Ok(path) => ExpoConfig::from_file(&path)?,
        Err(_) => ExpoConfig::from_env()?,
    };

    // Initialize logging
    let observability = config.observability_config();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "expo_station={level},expo_dispatcher={level}",
            level = observability.log_level
        )
        .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Expo Station");

    let station_config = config
        .station
        .clone()
        .ok_or_else(|| ExpoError::config("Station config not found"))?;
    let station = Station::new(station_config);

    let mut channel = station
        .clock_in()
        .await
        .context("failed to clock in with the dispatcher")?;

    tokio::select! {
        result = station.work(&mut channel) => {
            let served = result?;
            info!("Dispatcher ended the shift after {} orders", served);
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            station.clock_out().await?;
        }
    }

    info!("Expo Station shutdown complete");
    Ok(())
}
