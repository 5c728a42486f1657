use crate::error::IngressResult;
use crate::service::{ProbeDispatcher, ProbeRequest};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

/// `/health` and `/v1/probe`.
pub fn router(dispatcher: ProbeDispatcher) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/probe", post(create_probe))
        .with_state(dispatcher)
}

async fn health() -> &'static str {
    "OK"
}

async fn create_probe(
    State(dispatcher): State<ProbeDispatcher>,
    Json(request): Json<ProbeRequest>,
) -> IngressResult<&'static str> {
    dispatcher.dispatch(request).await?;
    Ok("OK")
}
