//! Relay HTTP/WebSocket surface.
//!
//! Three audiences share one router: agents (`/agent/ws`, authenticated by
//! endpoint secret), enrolling machines (`/api/enroll*`, authenticated by
//! enrollment token), and operators (everything else, authenticated by
//! session token or WebSocket ticket through [`auth::require_operator`]).

mod agent_ws;
pub mod auth;
mod enroll;
pub mod error;
mod handlers;
mod terminal_ws;
pub mod ticket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::catalog::ActionCatalog;
use crate::identity::{SecretBox, TokenService};
use crate::link::AgentRegistry;
use crate::store::Store;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub tokens: TokenService,
    pub secrets: Arc<SecretBox>,
    pub catalog: Arc<ActionCatalog>,
    pub agents: AgentRegistry,
    /// Short-lived ticket store for WebSocket authentication.
    pub tickets: Arc<ticket::TicketStore>,
    /// Default lifetime of admin-minted enrollment tokens.
    pub enrollment_ttl: Duration,
}

impl AppState {
    pub fn new(store: Store, tokens: TokenService, secrets: SecretBox) -> Self {
        Self {
            store,
            tokens,
            secrets: Arc::new(secrets),
            catalog: Arc::new(ActionCatalog::builtin()),
            agents: AgentRegistry::new(),
            tickets: Arc::new(ticket::TicketStore::new()),
            enrollment_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests: no loopback exemption, no CORS,
/// no rate limiting.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub allow_loopback_admin: bool,
    pub cors_origins: Vec<String>,
    /// Requests per second per client IP on `/auth/*`.
    pub auth_rate_limit: Option<u32>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let operator_auth = Arc::new(auth::OperatorAuth {
        tokens: state.tokens.clone(),
        tickets: state.tickets.clone(),
        allow_loopback_admin: config.allow_loopback_admin,
    });

    let endpoint_routes = Router::new()
        .route("/execute", post(endpoint_execute))
        .route("/remediate", post(endpoint_remediate))
        .route("/terminal/start", post(terminal_start))
        .route("/terminal/input", post(terminal_input))
        .route("/terminal/stop", post(terminal_stop))
        .route("/terminal/ws", get(terminal_ws::terminal_ws));

    let admin_routes = Router::new()
        .route("/tenants", post(admin_create_tenant))
        .route("/operators", post(admin_create_operator))
        .route("/enrollment-tokens", post(admin_enrollment_token))
        .route("/assignments", post(admin_assign))
        .route("/endpoints/{id}/disable", post(admin_disable_endpoint));

    let protected = Router::new()
        .route("/api/endpoints", get(endpoint_list))
        .route("/api/actions", get(action_list))
        .nest("/api/endpoints/{id}", endpoint_routes)
        .nest("/api/admin", admin_routes)
        .route("/auth/2fa/setup", post(two_factor_setup))
        .route("/auth/2fa/enable", post(two_factor_enable))
        .route("/auth/ws-ticket", post(ws_ticket))
        .layer(axum::middleware::from_fn(move |req, next| {
            let a = operator_auth.clone();
            async move { auth::require_operator(a, req, next).await }
        }));

    let login_routes = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/2fa/verify", post(two_factor_verify));

    // Apply rate limiting to the credential-checking routes if configured.
    let login_routes = if let Some(rps) = config.auth_rate_limit {
        use tower_governor::{governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer};
        let rps = rps.max(1);
        match GovernorConfigBuilder::default()
            .per_second(u64::from(rps))
            .burst_size(rps)
            .key_extractor(PeerIpKeyExtractor)
            .finish()
        {
            Some(conf) => login_routes.layer(GovernorLayer::new(Arc::new(conf))),
            None => {
                tracing::warn!(rps, "invalid auth rate limit, limiter disabled");
                login_routes
            }
        }
    } else {
        login_routes
    };

    let router = Router::new()
        .route("/health", get(health))
        .route("/agent/ws", get(agent_ws::agent_ws))
        .route("/api/enroll", post(enroll::enroll))
        .route("/api/enroll/status/{machine_id}", get(enroll::enroll_status))
        .merge(login_routes)
        .merge(protected)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cache-control"),
            HeaderValue::from_static("no-store"),
        ));

    // Conditionally apply CORS if origins are configured.
    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}

/// Serve `app` on `listener` until `shutdown` resolves. Peer addresses are
/// recorded for rate limiting and the loopback exemption.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}
