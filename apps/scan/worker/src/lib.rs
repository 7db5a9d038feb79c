//! Scan Worker Service
//!
//! Consumes scan requests from RabbitMQ and hands each one to the scanner
//! service over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ (scan.requests)
//!   ↓ basic.consume, manual ack, prefetch
//! AmqpWorker (registry + channel pool)
//!   ↓ POST, X-RabbitMQ-Delivery-Tag: <correlation id>
//! Scanner service
//!   ↓ 2xx / 4xx / 5xx right away, or 202 and later:
//! POST /deliveries/complete (same header, {"outcome": ...})
//!   ↓
//! basic.ack / basic.nack on the channel that received the delivery
//! ```
//!
//! ## Features
//!
//! - Exactly one acknowledgment per delivery, on the right channel
//! - Reconnect with exponential backoff, stale acknowledgments skipped
//! - Stale delivery sweep every monitor interval
//! - Graceful drain on SIGTERM, remaining deliveries requeued
//! - Health, readiness and metrics endpoints for Kubernetes

pub mod config;

use amqp_worker::{AdminState, AmqpWorker, HttpExecutor, LapinConnector, admin_router, metrics};
use axum::Router;
use config::ScanWorkerConfig;
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv, app_info};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Start the health, metrics and callback HTTP server
///
/// Stays up through the drain so late completion callbacks still land.
async fn start_admin_server(state: AdminState, server: ServerConfig) -> Result<()> {
    let app: Router = admin_router(state);

    let addr = server.socket_addr().wrap_err("Invalid admin server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {addr}"))?;

    info!(%addr, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Admin server failed")?;

    Ok(())
}

/// Run the scan worker
///
/// 1. Sets up error reports and structured logging (JSON for prod, pretty for dev)
/// 2. Loads configuration from the environment
/// 3. Starts the admin server
/// 4. Runs the worker until SIGINT/SIGTERM, then drains
///
/// A broker that is down at boot is not an error: the pool keeps retrying
/// with backoff and readiness reports 503 meanwhile.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to initialize Prometheus metrics")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, environment = ?environment, "Starting scan worker service");

    let config = ScanWorkerConfig::from_env().wrap_err("Failed to load scan worker configuration")?;
    info!(
        amqp = %config.amqp.redacted_url(),
        queues = ?config.queues,
        target = %config.target_url,
        max_concurrent_tasks = config.max_concurrent_tasks,
        max_redeliveries = ?config.max_redeliveries,
        "Worker configuration loaded"
    );

    let mut executor = HttpExecutor::new(config.target_url.clone(), config.target_timeout)
        .wrap_err("Failed to create HTTP executor")?;
    if let Some(breaker) = config.circuit_breaker() {
        executor = executor.with_circuit_breaker(breaker);
    }

    let connector = LapinConnector::new(config.amqp.url.clone()).with_connection_name(app_info.name.clone());
    let worker = AmqpWorker::new(Arc::new(connector), Arc::new(executor), config.worker_config())
        .wrap_err("Invalid worker configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        shutdown_tx.send_replace(true);
    });

    let admin_state = AdminState::from_worker(&worker, app_info.name, app_info.version);
    let server = config.server.clone();
    tokio::spawn(async move {
        if let Err(e) = start_admin_server(admin_state, server).await {
            error!(error = ?e, "Admin server failed");
        }
    });

    worker
        .run(shutdown_rx)
        .await
        .wrap_err("Scan worker failed")?;

    info!("Scan worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}
