//! MZC-66 Bridge
//!
//! Speakercraft MZC-66 zone control over HTTP and MQTT.

use mzc66_bridge::{adapters, api, bus, client, config, platform};

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mzc66_bridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting MZC-66 Bridge v{} ({})",
        env!("MZC_VERSION"),
        env!("MZC_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config()?;
    tracing::info!("Configuration loaded, port: {}", config.port);

    let layout = config::load_amps_config()?;
    tracing::info!("Amplifier layout loaded: {} amplifier(s)", layout.amps.len());

    // Create event bus
    let bus = bus::create_bus();
    tracing::info!("Event bus initialized");

    let shutdown = CancellationToken::new();

    // Speakercraft adapter: setup is retried by the handle until every
    // amplifier is reachable
    let connector = Arc::new(client::SimulatedConnector::new(config.simulated_zones));
    let context = Arc::new(platform::IntegrationContext::new(bus.clone(), connector));
    let speakercraft = Arc::new(adapters::SpeakercraftAdapter::new(
        context,
        layout,
        Duration::from_secs(config.poll_interval_secs),
    ));
    let handle = adapters::AdapterHandle::new(speakercraft.clone(), bus.clone(), shutdown.clone());
    let adapter_task = tokio::spawn(handle.run_with_retry(adapters::RetryConfig::default()));

    // Initialize MQTT adapter
    let mqtt = Arc::new(adapters::mqtt::MqttAdapter::new(bus.clone()));
    if let Some(ref mqtt_config) = config.mqtt {
        mqtt.configure(
            mqtt_config.host.clone(),
            Some(mqtt_config.port),
            mqtt_config.username.clone(),
            mqtt_config.password.clone(),
            mqtt_config.topic_prefix.clone(),
        )
        .await;

        if let Err(e) = mqtt.start().await {
            tracing::warn!("Failed to start MQTT adapter: {}", e);
        } else {
            tracing::info!("MQTT adapter started for {}", mqtt_config.host);
        }
    }

    let state = api::AppState::new(speakercraft, mqtt.clone(), bus.clone());
    let app = api::router(state);

    // Start server with graceful shutdown
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: stop adapters
    tracing::info!("Shutting down adapters...");
    bus.publish(bus::BusEvent::ShuttingDown {
        reason: Some("signal".to_string()),
    });
    shutdown.cancel();
    if let Err(e) = adapter_task.await {
        tracing::warn!("Speakercraft adapter task failed: {}", e);
    }
    mqtt.stop().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
