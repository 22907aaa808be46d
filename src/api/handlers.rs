use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::catalog::ActionInfo;
use crate::identity::{otp, BackupCodes, Principal, Purpose, Role};
use crate::link::AgentLink;
use crate::remediation::RemediationResult;
use crate::runner::ExecutionResult;
use crate::scope;
use crate::store::{Assignment, EndpointRecord, OperatorRecord, Tenant, OPERATOR_BCRYPT_COST};

/// Bcrypt cost for operators created over the API.

pub(super) async fn health() -> &'static str {
    "ok"
}

// ── Authorization helpers ───────────────────────────────────────────

fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    if principal.role.is_admin() {
        Ok(())
    } else {
        tracing::warn!(operator = %principal.id, role = %principal.role, "admin route denied");
        Err(ApiError::AccessDenied)
    }
}

/// Scope-check `endpoint_id` for `principal` and return its live link.
///
/// Missing and out-of-scope endpoints fail identically.
pub(super) fn authorize_endpoint(
    state: &AppState,
    principal: &Principal,
    endpoint_id: &str,
) -> Result<Arc<AgentLink>, ApiError> {
    let scope = scope::resolve(&state.store, Some(principal))?;
    if !scope::is_endpoint_in_scope(&state.store, endpoint_id, &scope)? {
        tracing::warn!(
            operator = %principal.id,
            endpoint = endpoint_id,
            "endpoint access denied"
        );
        return Err(ApiError::AccessDenied);
    }
    state.agents.get(endpoint_id).ok_or(ApiError::EndpointOffline)
}

fn operator_for(state: &AppState, principal: &Principal) -> Result<OperatorRecord, ApiError> {
    state
        .store
        .operator(&principal.id)?
        .ok_or(ApiError::NotFound("operator"))
}

// ── Login and second factor ─────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(super) enum LoginResponse {
    Session {
        token: String,
        principal: Principal,
    },
    SecondFactor {
        two_factor_required: bool,
        token: String,
    },
}

pub(super) async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let store = state.store.clone();
    let username = req.username.clone();
    // bcrypt blocks; keep it off the async workers.
    let record = tokio::task::spawn_blocking(move || store.verify_password(&username, &req.password))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))??;

    let Some(record) = record else {
        tracing::info!(username = %req.username, "login failed");
        return Err(ApiError::AuthInvalid);
    };
    let principal = record.principal();
    if record.totp_enabled {
        tracing::info!(operator = %principal.id, "password accepted, second factor required");
        return Ok(Json(LoginResponse::SecondFactor {
            two_factor_required: true,
            token: state.tokens.issue_purpose(&principal, Purpose::TwoFactorLogin),
        }));
    }
    tracing::info!(operator = %principal.id, "login succeeded");
    Ok(Json(LoginResponse::Session {
        token: state.tokens.issue_session(&principal),
        principal,
    }))
}

#[derive(Deserialize)]
pub(super) struct VerifyRequest {
    token: String,
    code: String,
}

#[derive(Serialize)]
pub(super) struct SessionResponse {
    token: String,
    principal: Principal,
}

fn looks_like_otp(code: &str) -> bool {
    code.len() == otp::DIGITS && code.bytes().all(|b| b.is_ascii_digit())
}

fn open_seed(state: &AppState, record: &OperatorRecord) -> Result<Vec<u8>, ApiError> {
    let sealed = record
        .totp_seed
        .as_deref()
        .ok_or_else(|| ApiError::InvalidRequest("second factor is not set up".into()))?;
    let hex_seed = state.secrets.open(sealed)?;
    hex::decode(hex_seed).map_err(|e| ApiError::InternalError(format!("corrupt seed: {e}")))
}

/// Spend one backup code. The stored blob is swapped conditionally so two
/// concurrent attempts cannot both spend the same code.
fn consume_backup_code(state: &AppState, record: &OperatorRecord, code: &str) -> Result<bool, ApiError> {
    let Some(stored) = record.backup_codes.as_deref() else {
        return Ok(false);
    };
    let mut codes = BackupCodes::open(stored, &state.secrets)?;
    if !codes.consume(code) {
        return Ok(false);
    }
    let resealed = codes.seal(&state.secrets)?;
    if !state.store.replace_backup_codes(&record.id, stored, &resealed)? {
        tracing::warn!(operator = %record.id, "concurrent backup code use rejected");
        return Ok(false);
    }
    tracing::info!(operator = %record.id, remaining = codes.remaining(), "backup code used");
    Ok(true)
}

pub(super) async fn two_factor_verify(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let principal = state.tokens.verify_purpose(&req.token, Purpose::TwoFactorLogin)?;
    let record = state
        .store
        .operator(&principal.id)?
        .ok_or(ApiError::AuthInvalid)?;
    if !record.totp_enabled {
        return Err(ApiError::AuthInvalid);
    }

    let code = req.code.trim();
    let accepted = if looks_like_otp(code) {
        otp::verify(&open_seed(&state, &record)?, code)
    } else {
        consume_backup_code(&state, &record, code)?
    };
    if !accepted {
        tracing::info!(operator = %principal.id, "second factor rejected");
        return Err(ApiError::AuthInvalid);
    }

    let principal = record.principal();
    Ok(Json(SessionResponse {
        token: state.tokens.issue_session(&principal),
        principal,
    }))
}

#[derive(Serialize)]
pub(super) struct SetupResponse {
    /// Hex seed for the authenticator.
    seed: String,
    setup_token: String,
}

pub(super) async fn two_factor_setup(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<SetupResponse>, ApiError> {
    let record = operator_for(&state, &principal)?;
    if record.totp_enabled {
        return Err(ApiError::Conflict("second factor".into()));
    }
    let seed = hex::encode(otp::generate_seed());
    let sealed = state.secrets.seal(&seed)?;
    state.store.set_totp(&record.id, Some(&sealed), false)?;
    Ok(Json(SetupResponse {
        seed,
        setup_token: state.tokens.issue_purpose(&principal, Purpose::TwoFactorSetup),
    }))
}

#[derive(Deserialize)]
pub(super) struct EnableRequest {
    setup_token: String,
    code: String,
}

#[derive(Serialize)]
pub(super) struct EnableResponse {
    /// Shown once.
    backup_codes: Vec<String>,
}

pub(super) async fn two_factor_enable(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<EnableRequest>,
) -> Result<Json<EnableResponse>, ApiError> {
    let owner = state
        .tokens
        .verify_purpose(&req.setup_token, Purpose::TwoFactorSetup)?;
    if owner.id != principal.id {
        return Err(ApiError::AuthInvalid);
    }
    let record = operator_for(&state, &principal)?;
    if !otp::verify(&open_seed(&state, &record)?, req.code.trim()) {
        return Err(ApiError::InvalidRequest("code does not match".into()));
    }

    let (codes, hashed) = BackupCodes::generate();
    let sealed_codes = hashed.seal(&state.secrets)?;
    state.store.set_totp(&record.id, record.totp_seed.as_deref(), true)?;
    state.store.set_backup_codes(&record.id, Some(&sealed_codes))?;
    tracing::info!(operator = %record.id, "second factor enabled");
    Ok(Json(EnableResponse { backup_codes: codes }))
}

#[derive(Serialize)]
pub(super) struct TicketResponse {
    ticket: String,
}

pub(super) async fn ws_ticket(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<TicketResponse>, ApiError> {
    let ticket = state
        .tickets
        .create(principal)
        .map_err(|_| ApiError::TicketLimit)?;
    Ok(Json(TicketResponse { ticket }))
}

// ── Endpoints and actions ───────────────────────────────────────────

pub(super) async fn endpoint_list(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<EndpointRecord>>, ApiError> {
    let scope = scope::resolve(&state.store, Some(&principal))?;
    Ok(Json(state.store.list_endpoints(&scope)?))
}

pub(super) async fn action_list(State(state): State<AppState>) -> Json<Vec<ActionInfo>> {
    Json(state.catalog.iter().cloned().collect())
}

#[derive(Deserialize)]
pub(super) struct ExecuteRequest {
    path: String,
    arguments: Option<String>,
    timeout_secs: Option<u64>,
}

pub(super) async fn endpoint_execute(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(endpoint_id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecutionResult>), ApiError> {
    let link = authorize_endpoint(&state, &principal, &endpoint_id)?;
    if req.path.trim().is_empty() {
        return Err(ApiError::InvalidRequest("path must not be empty".into()));
    }
    tracing::info!(
        operator = %principal.id,
        endpoint = %endpoint_id,
        path = %req.path,
        "installer execution requested"
    );
    let result = link.execute(req.path, req.arguments, req.timeout_secs).await?;
    let status = if result.rejection.is_some() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

#[derive(Deserialize)]
pub(super) struct RemediateRequest {
    action_id: String,
    parameter: Option<String>,
}

pub(super) async fn endpoint_remediate(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(endpoint_id): Path<String>,
    Json(req): Json<RemediateRequest>,
) -> Result<Json<RemediationResult>, ApiError> {
    let link = authorize_endpoint(&state, &principal, &endpoint_id)?;
    if !state.catalog.is_allowed(&req.action_id) {
        return Err(ApiError::InvalidRequest(format!("unknown action '{}'", req.action_id)));
    }
    tracing::info!(
        operator = %principal.id,
        endpoint = %endpoint_id,
        action = %req.action_id,
        "remediation requested"
    );
    Ok(Json(link.remediate(req.action_id, req.parameter).await?))
}

#[derive(Serialize)]
pub(super) struct Ack {
    ok: bool,
}

pub(super) async fn terminal_start(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(endpoint_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    let link = authorize_endpoint(&state, &principal, &endpoint_id)?;
    link.terminal_start().await?;
    tracing::info!(operator = %principal.id, endpoint = %endpoint_id, "terminal started");
    Ok(Json(Ack { ok: true }))
}

#[derive(Deserialize)]
pub(super) struct InputRequest {
    data: String,
}

pub(super) async fn terminal_input(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(endpoint_id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<Json<Ack>, ApiError> {
    let link = authorize_endpoint(&state, &principal, &endpoint_id)?;
    link.terminal_input(req.data).await?;
    Ok(Json(Ack { ok: true }))
}

pub(super) async fn terminal_stop(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(endpoint_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    let link = authorize_endpoint(&state, &principal, &endpoint_id)?;
    link.terminal_stop().await?;
    tracing::info!(operator = %principal.id, endpoint = %endpoint_id, "terminal stopped");
    Ok(Json(Ack { ok: true }))
}

// ── Administration ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct TenantRequest {
    name: String,
}

pub(super) async fn admin_create_tenant(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<TenantRequest>,
) -> Result<(StatusCode, Json<Tenant>), ApiError> {
    require_admin(&principal)?;
    let tenant = state.store.create_tenant(&req.name)?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

#[derive(Deserialize)]
pub(super) struct OperatorRequest {
    username: String,
    display_name: Option<String>,
    role: Role,
    password: String,
}

#[derive(Serialize)]
pub(super) struct OperatorResponse {
    id: String,
    username: String,
    role: Role,
}

pub(super) async fn admin_create_operator(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<OperatorRequest>,
) -> Result<(StatusCode, Json<OperatorResponse>), ApiError> {
    require_admin(&principal)?;
    // Only a superadmin may mint other administrators.
    if req.role.is_admin() && principal.role != Role::Superadmin {
        return Err(ApiError::AccessDenied);
    }
    if req.role == Role::Unauthenticated {
        return Err(ApiError::InvalidRequest("role must be technician, admin or superadmin".into()));
    }
    let store = state.store.clone();
    let record = tokio::task::spawn_blocking(move || {
        let display = req.display_name.unwrap_or_else(|| req.username.clone());
        store.create_operator(&req.username, &display, req.role, &req.password, OPERATOR_BCRYPT_COST)
    })
    .await
    .map_err(|e| ApiError::InternalError(e.to_string()))??;
    tracing::info!(by = %principal.id, operator = %record.id, role = %record.role, "operator created");
    Ok((
        StatusCode::CREATED,
        Json(OperatorResponse {
            id: record.id,
            username: record.username,
            role: record.role,
        }),
    ))
}

#[derive(Deserialize)]
pub(super) struct EnrollmentTokenRequest {
    tenant_id: String,
    ttl_hours: Option<u64>,
}

#[derive(Serialize)]
pub(super) struct EnrollmentTokenResponse {
    token: String,
    expires_in_secs: u64,
}

pub(super) async fn admin_enrollment_token(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<EnrollmentTokenRequest>,
) -> Result<(StatusCode, Json<EnrollmentTokenResponse>), ApiError> {
    require_admin(&principal)?;
    let ttl = match req.ttl_hours {
        Some(0) => return Err(ApiError::InvalidRequest("ttl_hours must be positive".into())),
        Some(h) => Duration::from_secs(h.saturating_mul(3600)),
        None => state.enrollment_ttl,
    };
    let token = state.store.create_enrollment_token(&req.tenant_id, ttl)?;
    Ok((
        StatusCode::CREATED,
        Json(EnrollmentTokenResponse {
            token,
            expires_in_secs: ttl.as_secs(),
        }),
    ))
}

#[derive(Deserialize)]
pub(super) struct AssignmentRequest {
    operator_id: String,
    tenant_id: Option<String>,
    endpoint_id: Option<String>,
}

pub(super) async fn admin_assign(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AssignmentRequest>,
) -> Result<StatusCode, ApiError> {
    require_admin(&principal)?;
    let assignment = match (req.tenant_id, req.endpoint_id) {
        (Some(t), None) => Assignment::Tenant(t),
        (None, Some(e)) => Assignment::Endpoint(e),
        _ => {
            return Err(ApiError::InvalidRequest(
                "exactly one of tenant_id or endpoint_id is required".into(),
            ))
        }
    };
    state.store.assign(&req.operator_id, &assignment)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn admin_disable_endpoint(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(endpoint_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&principal)?;
    if !state.store.disable_endpoint(&endpoint_id)? {
        return Err(ApiError::NotFound("endpoint"));
    }
    if let Some(link) = state.agents.get(&endpoint_id) {
        link.close();
    }
    tracing::warn!(by = %principal.id, endpoint = %endpoint_id, "endpoint disabled");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_shape_detection() {
        assert!(looks_like_otp("012345"));
        assert!(!looks_like_otp("01234"));
        assert!(!looks_like_otp("abcd-efgh"));
        assert!(!looks_like_otp("12345a"));
    }

    #[test]
    fn admin_guard() {
        let mut p = Principal::local_superadmin();
        assert!(require_admin(&p).is_ok());
        p.role = Role::Technician;
        assert!(matches!(require_admin(&p), Err(ApiError::AccessDenied)));
    }
}
