//! Error mapping shared by the admin and server-to-server handlers.

use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use souk_federation::{FederationError, Rejection, RejectionReason};
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

const NOT_INITIALIZED: &str = "local server identity has not been initialized";

impl From<FederationError> for ApiError {
    /// Admin-surface mapping. Server-to-server handlers go through
    /// [`ApiError::from_peer`] instead.
    fn from(err: FederationError) -> Self {
        match err {
            FederationError::NotInitialized => ApiError::Conflict(NOT_INITIALIZED.to_string()),
            FederationError::ServerNotFound(id) => {
                ApiError::NotFound(format!("federated server {id} not found"))
            }
            FederationError::InvalidInput(msg) => ApiError::BadRequest(msg),
            FederationError::Conflict(msg) => ApiError::Conflict(msg),
            FederationError::Network(msg)
            | FederationError::RemoteServer(msg)
            | FederationError::Security(msg) => ApiError::BadGateway(msg),
            FederationError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            other => {
                tracing::error!("federation operation failed: {}", other);
                ApiError::InternalServerError("internal error".to_string())
            }
        }
    }
}

impl ApiError {
    /// Maps a policy refusal to a response that says no more than the
    /// reason's public message.
    pub fn rejected(rejection: &Rejection) -> Self {
        let message = rejection.public_message().to_string();
        match rejection.reason {
            RejectionReason::MalformedRequest | RejectionReason::MalformedAddress => {
                ApiError::BadRequest(message)
            }
            RejectionReason::UrlConflict => ApiError::Conflict(message),
            reason if reason.is_authentication() => ApiError::Unauthorized(message),
            _ => ApiError::Forbidden(message),
        }
    }

    /// Server-to-server mapping: peers get no detail beyond the status,
    /// and a server without an identity is unavailable rather than
    /// misconfigured.
    pub fn from_peer(err: FederationError) -> Self {
        match err {
            FederationError::NotInitialized => {
                ApiError::ServiceUnavailable("federation is not available".to_string())
            }
            FederationError::InvalidInput(_) => {
                ApiError::BadRequest(RejectionReason::MalformedRequest.public_message().to_string())
            }
            other => {
                tracing::error!("federation request failed: {}", other);
                ApiError::InternalServerError("internal error".to_string())
            }
        }
    }
}
