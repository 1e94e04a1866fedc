//! Gateway-level error type and its HTTP mapping.

use crate::config::ConfigError;
use crate::router::{Attempt, RouteError};
use crate::whitelist::WhitelistError;
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid whitelist: {0}")]
    Whitelist(#[from] WhitelistError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}

/// Error response structure for JSON serialization.
#[derive(Serialize)]
struct ErrorResponseBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: String,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<&'a [Attempt]>,
}

impl GatewayError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Route(RouteError::AllProvidersUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Route(RouteError::AggregateFailure { .. }) => StatusCode::BAD_GATEWAY,
            Self::Route(RouteError::DeadlineExceeded { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Route(RouteError::UnknownProvider(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidRequest(_) | Self::Whitelist(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) | Self::Http(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Route(RouteError::AllProvidersUnavailable { .. }) => "service_unavailable",
            Self::Route(RouteError::AggregateFailure { .. }) => "upstream_error",
            Self::Route(RouteError::DeadlineExceeded { .. }) => "timeout",
            Self::Route(RouteError::UnknownProvider(_)) => "unknown_provider",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Whitelist(_) => "invalid_whitelist",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "configuration_error",
            Self::Http(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }

        let attempts = match &self {
            Self::Route(route) if !route.attempts().is_empty() => Some(route.attempts()),
            _ => None,
        };
        let body = ErrorResponseBody {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type(),
                attempts,
            },
        };

        (status, Json(body)).into_response()
    }
}
