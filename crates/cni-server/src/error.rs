//! CNI server errors

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use staticip::StaticIpError;
use thiserror::Error;
use tracing::error;

use crate::api::ErrorResponse;

/// Errors returned by the acquisition endpoint
#[derive(Debug, Error)]
pub enum CniServerError {
    /// Cluster lookup or record update failed
    #[error("StaticIP error: {0}")]
    StaticIp(#[from] StaticIpError),

    /// Host-side link setup failed
    #[error("Link error: {0}")]
    Link(String),

    /// Socket setup or teardown failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// StaticIP watch stopped
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Environment settings could not be read
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IntoResponse for CniServerError {
    fn into_response(self) -> Response {
        error!("Request failed: {}", self);
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
