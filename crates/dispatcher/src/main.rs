//! Expo Dispatcher - Main Entry Point
//!
//! Starts one operating period: an empty registry, a TCP listener, and a task
//! per inbound request until shutdown.

use anyhow::Context;
use expo_common::{ExpoConfig, METRICS};
use expo_dispatcher::{serve, Dispatcher};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn};
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
            "expo={level},expo_dispatcher={level}",
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

    info!("Starting Expo Dispatcher");

    let dispatcher_config = config.dispatcher_config();
    info!(
        "Dispatcher configuration loaded: bind={}, order_timeout={:?}, compaction_threshold={}",
        config.listen_address(),
        config.order_timeout(),
        dispatcher_config.compaction_threshold
    );

    let listener = TcpListener::bind(config.listen_address())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address()))?;

    let dispatcher = Arc::new(Dispatcher::new(&dispatcher_config));

    // Serve until the shutdown signal
    serve(listener, dispatcher.clone(), async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => {
                warn!("Failed to listen for shutdown signal, serving until killed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    })
    .await;

    info!(
        "Closing the day with {} workers on duty",
        dispatcher.registry().active_count()
    );
    debug!("Final metrics:\n{}", METRICS.gather());

    info!("Expo Dispatcher shutdown complete");
    Ok(())
}
