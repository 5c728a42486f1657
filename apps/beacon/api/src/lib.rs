//! Probe ingress
//!
//! Accepts `POST /v1/probe` requests, validates the target URL and the region
//! against the regions provisioned on the jobs stream, and publishes accepted
//! jobs onto `jobs.<region>.trace`. A durable subscription on `jobs.results`
//! logs the trace results the workers send back.
//!
//! ```text
//! caller ──POST /v1/probe──▶ ProbeDispatcher ──jobs.<region>.trace──▶ JetStream
//!                                                                    │
//!                            ResultSink ◀────────jobs.results────────┘
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod service;
pub mod sink;

use axum::Router;
use core_config::shutdown::shutdown_signal;
use core_config::{app_info, FromEnv};
use eyre::{Result, WrapErr};
use messaging::RegionRegistry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use config::Config;
pub use error::IngressError;
pub use service::{DispatchedJob, ProbeDispatcher, ProbeRequest};
pub use sink::ResultSink;

/// Full HTTP surface with request tracing.
pub fn app(dispatcher: ProbeDispatcher) -> Router {
    handlers::router(dispatcher).layer(TraceLayer::new_for_http())
}

/// Run the ingress until SIGINT/SIGTERM.
///
/// Fails if the broker cannot be reached, the jobs stream cannot be read or
/// the result subscription cannot be created.
pub async fn run() -> Result<()> {
    let config = Config::from_env().wrap_err("Failed to load configuration")?;
    core_config::tracing::init_tracing(&config.environment);

    let app_info = app_info!();
    info!(
        name = %app_info.name,
        version = %app_info.version,
        "Starting probe ingress"
    );

    let queue = messaging::connect(&config.nats)
        .await
        .wrap_err_with(|| format!("Failed to connect to broker at {}", config.nats.url))?;

    if !config.provision_regions.is_empty() {
        let subjects = RegionRegistry::from_regions(&config.provision_regions).stream_subjects();
        queue
            .ensure_stream(&subjects)
            .await
            .wrap_err_with(|| format!("Failed to provision stream '{}'", config.nats.stream))?;
    }

    let subjects = queue
        .provisioned_subjects()
        .await
        .wrap_err_with(|| format!("Failed to read subjects of stream '{}'", config.nats.stream))?;
    let registry = RegionRegistry::from_subjects(&subjects);

    if registry.is_empty() {
        warn!(stream = %config.nats.stream, "No regions are provisioned, every probe will be rejected");
    } else {
        info!(regions = ?registry.regions().collect::<Vec<_>>(), "Region registry loaded");
    }
    if !registry.contains(&config.default_region) {
        warn!(region = %config.default_region, "Default region is not provisioned");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sink = ResultSink::new(queue.clone(), &config.results_durable)
        .start(shutdown_rx)
        .await
        .wrap_err("Failed to subscribe to trace results")?;

    let dispatcher = ProbeDispatcher::new(queue.clone(), registry, config.default_region.clone());

    let address = config.server.address();
    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", address))?;
    info!(%address, backend = queue.backend(), "Probe ingress listening");

    axum::serve(listener, app(dispatcher))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("HTTP server failed")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sink.await {
        warn!(error = %e, "Result sink task failed");
    }

    queue
        .close()
        .await
        .wrap_err("Failed to close broker connection")?;

    info!("Probe ingress stopped");
    Ok(())
}
