use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::identity::{SecretError, TokenError};
use crate::link::LinkError;
use crate::store::StoreError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No credentials provided.
    AuthRequired,
    /// 401 - Credentials provided but invalid or expired.
    AuthInvalid,
    /// 403 - Authenticated but not permitted. Also used for endpoints that do
    /// not exist, so the two cannot be told apart.
    AccessDenied,
    /// 403 - Enrollment token unusable or endpoint disabled.
    EnrollmentRejected,
    /// 404 - A named resource (tenant, operator) was not found.
    NotFound(&'static str),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 409 - Resource already exists.
    Conflict(String),
    /// 409 - The agent declined a terminal control request.
    AgentRefused(String),
    /// 503 - The endpoint has no live agent connection.
    EndpointOffline,
    /// 504 - The agent did not answer in time.
    AgentTimeout,
    /// 503 - Too many pending WebSocket tickets.
    TicketLimit,
    /// 500 - Catch-all internal error. The detail is logged, never returned.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::AccessDenied => StatusCode::FORBIDDEN,
            ApiError::EnrollmentRejected => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::AgentRefused(_) => StatusCode::CONFLICT,
            ApiError::EndpointOffline => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::AgentTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::TicketLimit => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::AccessDenied => "access_denied",
            ApiError::EnrollmentRejected => "enrollment_rejected",
            ApiError::NotFound(_) => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Conflict(_) => "conflict",
            ApiError::AgentRefused(_) => "agent_refused",
            ApiError::EndpointOffline => "endpoint_offline",
            ApiError::AgentTimeout => "agent_timeout",
            ApiError::TicketLimit => "ticket_limit",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a session token via the Authorization header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid or expired credentials.".to_string(),
            ApiError::AccessDenied => "Access denied.".to_string(),
            ApiError::EnrollmentRejected => "Enrollment rejected.".to_string(),
            ApiError::NotFound(what) => format!("No such {what}."),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {detail}."),
            ApiError::Conflict(detail) => format!("{detail} already exists."),
            ApiError::AgentRefused(detail) => format!("Endpoint refused the request: {detail}."),
            ApiError::EndpointOffline => "Endpoint is not connected.".to_string(),
            ApiError::AgentTimeout => "Endpoint did not respond in time.".to_string(),
            ApiError::TicketLimit => "Too many pending tickets. Try again shortly.".to_string(),
            ApiError::InternalError(_) => "Internal error.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::InternalError(detail) = &self {
            tracing::error!(error = %detail, "request failed");
        }
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::Conflict(what) => ApiError::Conflict(what.to_string()),
            StoreError::Invalid(what) => ApiError::InvalidRequest(format!("invalid {what}")),
            StoreError::InvalidEnrollmentToken | StoreError::EndpointDisabled => {
                ApiError::EnrollmentRejected
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl From<LinkError> for ApiError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Disconnected => ApiError::EndpointOffline,
            LinkError::Timeout => ApiError::AgentTimeout,
            LinkError::Refused(reason) => ApiError::AgentRefused(reason),
            LinkError::UnexpectedReply => {
                ApiError::InternalError("endpoint sent an unexpected reply".to_string())
            }
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(_: TokenError) -> Self {
        ApiError::AuthInvalid
    }
}

impl From<SecretError> for ApiError {
    fn from(e: SecretError) -> Self {
        ApiError::InternalError(e.to_string())
    }
}
