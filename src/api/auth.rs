use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};

use super::error::ApiError;
use super::ticket::TicketStore;
use crate::identity::{Principal, TokenService};

/// What the operator authentication layer needs.
pub struct OperatorAuth {
    pub tokens: TokenService,
    pub tickets: Arc<TicketStore>,
    /// Unauthenticated loopback callers become [`Principal::local_superadmin`].
    pub allow_loopback_admin: bool,
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Extract a `?ticket=` value from the query string.
fn extract_ticket(req: &Request) -> Option<String> {
    req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("ticket=").map(|v| v.to_string()))
    })
}

/// Check if this request is a WebSocket upgrade.
fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn is_loopback_peer(req: &Request) -> bool {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .is_some_and(|ConnectInfo(addr)| addr.ip().is_loopback())
}

/// Resolve the caller to a [`Principal`] and attach it as a request
/// extension.
///
/// Authentication flow:
/// 1. Bearer session token. A present but invalid token is rejected outright.
/// 2. For WebSocket upgrades, a `?ticket=` issued by `/auth/ws-ticket`
///    (single-use, 30s TTL).
/// 3. The loopback exemption, when enabled.
/// 4. Otherwise reject.
pub async fn require_operator(
    auth: Arc<OperatorAuth>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = if let Some(token) = extract_bearer(&req) {
        auth.tokens.verify_session(token).map_err(|e| {
            tracing::debug!(error = %e, "session token rejected");
            ApiError::AuthInvalid
        })?
    } else if let Some(principal) = is_ws_upgrade(&req)
        .then(|| extract_ticket(&req))
        .flatten()
        .and_then(|ticket| auth.tickets.redeem(&ticket))
    {
        principal
    } else if auth.allow_loopback_admin && is_loopback_peer(&req) {
        tracing::debug!(path = %req.uri().path(), "loopback request treated as local administrator");
        Principal::local_superadmin()
    } else {
        return Err(ApiError::AuthRequired);
    };

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
