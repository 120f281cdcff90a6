use ferry::capture::{spawn_watchers, EndpointRegistry};
use ferry::config::Config;
use ferry::controller::cdevents::HttpEventSink;
use ferry::controller::clock::{Clock, SystemClock};
use ferry::controller::Context;
use ferry::gateway::KubeGateway;
use ferry::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ApiState,
    ReadinessState,
};
use ferry::store::{MemoryStore, PgStore, PipelineStore};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long queued notifications get to drain after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the configured store: PostgreSQL when a URL is set, memory otherwise
///
/// Namespaces and services are owned by the service catalog in PostgreSQL.
/// The memory store starts empty, so without a database only the capturers
/// and the endpoint view do useful work.
async fn open_store(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn PipelineStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.run_migrations().await?;
            info!("Connected to PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            warn!(
                "FERRY_DATABASE_URL not set - using an empty in-memory store, \
                 workflows will report unknown services"
            );
            Ok(Arc::new(MemoryStore::new(clock)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting ferry release controller");

    let config = Config::from_env()?;

    // Create shutdown channel for coordinated shutdown
    let (shutdown_controller, shutdown_signal) = shutdown_channel();

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    let metrics = create_metrics()?;
    info!("Prometheus metrics registry initialized");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&config, clock.clone()).await?;
    let gateway =
        KubeGateway::new(client.clone(), config.gateway_timeout).with_metrics(metrics.clone());

    let cdevents_sink =
        HttpEventSink::new(config.cdevents_enabled, config.cdevents_sink_url.clone());
    info!(enabled = config.cdevents_enabled, "CDEvents sink configured");

    let ctx = Context::new(
        store,
        Arc::new(gateway),
        cdevents_sink,
        clock,
        Some(metrics.clone()),
    );
    let registry = Arc::new(EndpointRegistry::new());

    // Start HTTP server in background
    let api = ApiState::new(ctx.clone(), registry.clone());
    let server_readiness = readiness.clone();
    let server_metrics = metrics.clone();
    let server_shutdown = shutdown_signal.clone();
    let port = config.health_port;
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(port, server_readiness, server_metrics, api, server_shutdown).await
        {
            warn!(error = %e, "HTTP server failed");
        }
    });

    let watch_handles = spawn_watchers(
        client,
        ctx,
        registry,
        &config.watch,
        shutdown_signal.clone(),
    );

    readiness.set_ready();
    info!("Controller ready, watching cluster");

    // Run until shutdown signal received
    tokio::select! {
        _ = &mut server_handle => {
            error!("HTTP server stopped unexpectedly");
            readiness.set_not_ready();
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            // Mark not ready so K8s stops sending traffic during shutdown
            readiness.set_not_ready();
        }
    }

    // Trigger shutdown for all components
    shutdown_controller.shutdown();

    info!("Stopping components...");
    let drained =
        tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(watch_handles)).await;
    if drained.is_err() {
        warn!("Capture workers did not drain in time");
    }
    if !server_handle.is_finished() {
        server_handle.abort();
    }

    info!("ferry controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
