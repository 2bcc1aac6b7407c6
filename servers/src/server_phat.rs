//! # Phat Display Bridge Server
//!
//! Caches the single image shown on a fleet of 212x104 three-colour e-ink
//! displays and tells them about it over MQTT.
//!
//! - Clients `PUT` an image over HTTP; it is validated, converted to the
//!   black/white/red palette and cached.
//! - Every accepted upload, and a periodic timer, publishes
//!   `{"url": ..., "hash": ...}` on `phat/image`.
//! - Displays report their status on `phat/client/<id>`; the server keeps the
//!   last report per display and exposes it over HTTP and Prometheus.
//! - The server's own liveness is a retained `ALIVE`/`DEAD` on
//!   `phatserver/status`, and systemd's watchdog is fed while the broker
//!   connection is up.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;

mod phat_logic;
use phat_logic::{config, http, watchdog};

use lib_common::connections::mqtt_broker::{self, MqttSettings};
use lib_common::core::{Coordinator, CoordinatorConfig, TopicScheme};
use lib_common::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: Configuration & Logging ---
    dotenvy::dotenv().ok();
    let settings = config::load_config().context("failed to load configuration")?;
    let _log_guard = init_logging("server_phat", &settings.log_dir, &settings.log_level)
        .context("failed to initialise logging")?;
    tracing::info!(?settings, "starting server_phat");

    // --- Phase 2: Broker Connection ---
    let topics = TopicScheme::default();
    let mut mqtt_settings = MqttSettings::new(settings.broker.clone(), settings.client_id.clone());
    mqtt_settings.connect_timeout = settings.connect_timeout;
    mqtt_settings.topics = topics.clone();
    let connection = mqtt_broker::connect(mqtt_settings)
        .await
        .context("could not connect to MQTT broker")?;
    let connected = connection.connected_flag();

    // --- Phase 3: Coordinator ---
    let (coordinator, announce_worker) = Coordinator::new(
        Arc::new(connection.publisher()),
        CoordinatorConfig {
            external_url: settings.ext_host.clone(),
            topics,
        },
    )
    .context("failed to register metrics")?;
    let coordinator = Arc::new(coordinator);

    // --- Phase 4: Background Tasks ---
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let announce_handle = tokio::spawn(announce_worker.run(shutdown_tx.subscribe()));

    let periodic_handle = {
        let notifier = coordinator.notifier();
        let store = coordinator.store();
        let every = settings.announce_interval;
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { notifier.run_periodic(every, store, shutdown).await })
    };

    let mqtt_handle = tokio::spawn(connection.run(Arc::clone(&coordinator), shutdown_tx.subscribe()));

    let watchdog_handle = tokio::spawn(watchdog::run(connected, shutdown_tx.subscribe()));

    // --- Phase 5: HTTP Server ---
    let listener = tokio::net::TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    tracing::info!(listen = %settings.listen, "HTTP server listening");

    let app = http::router(Arc::clone(&coordinator));
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // --- Phase 6: Shutdown ---
    tracing::info!("HTTP server stopped; shutting down background tasks");
    let _ = shutdown_tx.send(());
    tokio::try_join!(announce_handle, periodic_handle, mqtt_handle, watchdog_handle)
        .context("background task panicked")?;

    tracing::info!("Shutdown complete.");
    Ok(())
}

/// Resolves on Ctrl-C or, on UNIX, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => tracing::info!("SIGTERM received, initiating shutdown."),
    }
}
