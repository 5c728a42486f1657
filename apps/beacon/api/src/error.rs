use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use messaging::QueueError;
use probe::TargetError;
use thiserror::Error;

pub const INVALID_TARGET_MESSAGE: &str =
    "Target is missing or invalid. Refer to the official documentation.";
pub const UNKNOWN_REGION_MESSAGE: &str = "Region is not available.";
pub const BROKER_UNAVAILABLE_MESSAGE: &str = "Failed to schedule the probe.";

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] TargetError),

    #[error("region '{0}' is not available")]
    UnknownRegion(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[from] QueueError),
}

pub type IngressResult<T> = Result<T, IngressError>;

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidTarget(_) | Self::UnknownRegion(_) => StatusCode::UNAUTHORIZED,
            Self::BrokerUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let body = match &self {
            Self::InvalidTarget(_) => INVALID_TARGET_MESSAGE,
            Self::UnknownRegion(_) => UNKNOWN_REGION_MESSAGE,
            Self::BrokerUnavailable(e) => {
                tracing::error!(error = %e, "Failed to publish probe job");
                BROKER_UNAVAILABLE_MESSAGE
            }
        };
        (self.status(), body).into_response()
    }
}
