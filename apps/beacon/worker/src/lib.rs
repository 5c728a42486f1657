//! Regional probe worker
//!
//! Attaches to the durable consumer `worker_<region>` (filter
//! `jobs.<region>.*`), probes every target it is handed and publishes the
//! timings on `jobs.results`. Jobs are acked only after their result is
//! published, so a crash or failure leaves them for redelivery.
//!
//! ```text
//! JetStream ──jobs.<region>.*──▶ Worker ──▶ JobHandler tasks ──▶ Prober
//!     ▲                                          │
//!     └───────────────jobs.results───────────────┘
//! ```

pub mod config;
pub mod health;
pub mod metrics;
pub mod worker;

use clap::Parser;
use core_config::app_info;
use core_config::shutdown::shutdown_signal;
use eyre::{Result, WrapErr};
use messaging::subject::{region_filter, RESULTS_SUBJECT};
use probe::Prober;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub use config::{Args, Config};
pub use health::{HealthServer, HealthState};
pub use crate::metrics::WorkerMetrics;
pub use worker::{DispatchError, JobHandler, JobOutcome, Worker};

/// Run the worker for the region given on the command line until
/// SIGINT/SIGTERM.
///
/// Fails if the broker is unreachable, the health port cannot be bound or
/// the durable consumer cannot be created.
pub async fn run() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args).wrap_err("Failed to load configuration")?;
    core_config::tracing::init_tracing(&config.environment);

    let app_info = app_info!();
    info!(
        name = %app_info.name,
        version = %app_info.version,
        region = %config.region,
        "Starting probe worker"
    );

    let metrics_handle =
        crate::metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let queue = messaging::connect(&config.nats)
        .await
        .wrap_err_with(|| format!("Failed to connect to broker at {}", config.nats.url))?;

    // Nothing else provisions a process-local broker.
    if config.nats.is_memory() {
        let subjects = vec![region_filter(&config.region), RESULTS_SUBJECT.to_string()];
        queue
            .ensure_stream(&subjects)
            .await
            .wrap_err("Failed to provision in-memory stream")?;
    }

    let prober = Prober::new(config.probe_timeout).wrap_err("Failed to build HTTP prober")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let health = HealthState::new(&config.region);
    let health_server =
        HealthServer::new(config.health_port, health.clone()).with_metrics(metrics_handle);
    let health_listener = health_server
        .bind()
        .await
        .wrap_err_with(|| format!("Failed to bind health port {}", config.health_port))?;
    let health_task = tokio::spawn(health_server.serve(health_listener, shutdown_rx.clone()));

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let handler = JobHandler::new(
        queue.clone(),
        Arc::new(prober),
        WorkerMetrics::new(&config.region),
        config.nak_delay,
    );
    let worker = Worker::new(
        queue.clone(),
        handler,
        config.consumer_spec(),
        config.concurrency(),
        health,
    );

    let outcome = worker
        .run(shutdown_rx)
        .await
        .wrap_err_with(|| format!("Failed to attach consumer worker_{}", config.region));

    if let Err(e) = queue.close().await {
        warn!(error = %e, "Failed to close broker connection");
    }

    // The worker may also stop because its subscription ended.
    let _ = shutdown_tx.send(true);
    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task panicked"),
    }

    outcome?;
    info!("Probe worker stopped");
    Ok(())
}
