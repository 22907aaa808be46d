//! Endpoint enrollment. Public routes: the enrollment token or the endpoint
//! secret is the credential.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::agent::connection::ENDPOINT_SECRET_HEADER;
use crate::store::EnrollmentGrant;

const MAX_FIELD_LEN: usize = 256;

#[derive(Deserialize)]
pub(super) struct EnrollRequest {
    enrollment_token: String,
    machine_id: String,
    hostname: String,
    os_version: String,
}

fn bounded(field: &str, value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() || value.len() > MAX_FIELD_LEN {
        return Err(ApiError::InvalidRequest(format!("{field} is missing or too long")));
    }
    Ok(value.to_string())
}

pub(super) async fn enroll(
    State(state): State<AppState>,
    Json(req): Json<EnrollRequest>,
) -> Result<Json<EnrollmentGrant>, ApiError> {
    let hostname = bounded("hostname", &req.hostname)?;
    let os_version = bounded("os_version", &req.os_version)?;
    let grant = state
        .store
        .enroll(req.enrollment_token.trim(), req.machine_id.trim(), &hostname, &os_version)
        .inspect_err(|e| tracing::warn!(machine_id = %req.machine_id, error = %e, "enrollment refused"))?;
    Ok(Json(grant))
}

#[derive(Debug, Serialize)]
pub(super) struct EnrollStatus {
    enrolled: bool,
    /// Whether the supplied `X-Endpoint-Secret` is currently valid.
    authenticated: bool,
}

pub(super) async fn enroll_status(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EnrollStatus>, ApiError> {
    let enrolled = state
        .store
        .endpoint(&machine_id)?
        .is_some_and(|e| !e.disabled);
    let authenticated = match headers
        .get(ENDPOINT_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(secret) if enrolled => state.store.verify_endpoint_secret(&machine_id, secret)?,
        _ => false,
    };
    Ok(Json(EnrollStatus {
        enrolled,
        authenticated,
    }))
}
