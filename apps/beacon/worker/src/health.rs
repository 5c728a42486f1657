//! Liveness, readiness and metrics endpoints for the worker.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub region: String,
    pub consumer_attached: bool,
    pub worker_healthy: bool,
}

/// Shared between the worker loop and the health server.
#[derive(Clone)]
pub struct HealthState {
    region: Arc<str>,
    inner: Arc<RwLock<HealthStateInner>>,
}

struct HealthStateInner {
    consumer_attached: bool,
    worker_healthy: bool,
    last_error: Option<String>,
}

impl HealthState {
    /// Alive but not ready until the consumer is attached.
    pub fn new(region: &str) -> Self {
        Self {
            region: Arc::from(region),
            inner: Arc::new(RwLock::new(HealthStateInner {
                consumer_attached: false,
                worker_healthy: true,
                last_error: None,
            })),
        }
    }

    pub async fn set_consumer_attached(&self, attached: bool) {
        self.inner.write().await.consumer_attached = attached;
    }

    pub async fn set_worker_healthy(&self, healthy: bool) {
        self.inner.write().await.worker_healthy = healthy;
    }

    pub async fn set_error(&self, error: Option<String>) {
        self.inner.write().await.last_error = error;
    }

    /// Liveness ignores the consumer; a broker hiccup should not restart the pod.
    pub async fn is_alive(&self) -> bool {
        self.inner.read().await.worker_healthy
    }

    pub async fn is_ready(&self) -> bool {
        let inner = self.inner.read().await;
        inner.consumer_attached && inner.worker_healthy
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let status = if inner.consumer_attached && inner.worker_healthy {
            "healthy".to_string()
        } else {
            format!(
                "unhealthy: {}",
                inner.last_error.as_deref().unwrap_or("consumer not attached")
            )
        };

        HealthStatus {
            status,
            region: self.region.to_string(),
            consumer_attached: inner.consumer_attached,
            worker_healthy: inner.worker_healthy,
        }
    }
}

pub struct HealthServer {
    port: u16,
    state: HealthState,
    metrics_handle: Option<PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16, state: HealthState) -> Self {
        Self {
            port,
            state,
            metrics_handle: None,
        }
    }

    /// Serve `/metrics` from this handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn state(&self) -> HealthState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
    }

    /// Bind the health port. Call before spawning [`HealthServer::serve`] so
    /// a taken port fails startup.
    pub async fn bind(&self) -> Result<TcpListener, std::io::Error> {
        TcpListener::bind(("0.0.0.0", self.port)).await
    }

    /// Serve on `listener` until `shutdown` flips to true.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), std::io::Error> {
        let router = self.router();
        info!(addr = ?listener.local_addr()?, "Starting health server");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}
