#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
};
use deskrelay::agent::AgentRuntime;
use deskrelay::api::{router, AppState, RouterConfig};
use deskrelay::catalog::ActionCatalog;
use deskrelay::identity::{Role, SecretBox, TokenService};
use deskrelay::link::AgentLink;
use deskrelay::remediation::{ActionOutput, Elevation, RemediationAction, RemediationDispatcher};
use deskrelay::runner::ProcessRunner;
use deskrelay::store::{Assignment, OperatorRecord, Store};
use deskrelay::terminal::{TerminalEvent, TerminalSession};
use deskrelay::validator::CommandValidator;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const PASSWORD: &str = "correct horse battery staple";

/// Cheapest cost bcrypt accepts, for fast tests.
pub const TEST_BCRYPT_COST: u32 = 4;

pub fn test_state() -> AppState {
    let store = Store::open_in_memory().expect("in-memory store");
    let tokens = TokenService::new(&[7u8; 32]).expect("token key");
    let secrets = SecretBox::new(&[9u8; 32]).expect("secret key");
    AppState::new(store, tokens, secrets)
}

pub fn test_app(state: &AppState) -> axum::Router {
    router(state.clone(), RouterConfig::default())
}

pub fn create_operator(state: &AppState, username: &str, role: Role) -> OperatorRecord {
    state
        .store
        .create_operator(username, username, role, PASSWORD, TEST_BCRYPT_COST)
        .expect("create operator")
}

pub fn session_token(state: &AppState, operator: &OperatorRecord) -> String {
    state.tokens.issue_session(&operator.principal())
}

/// Enroll a machine into `tenant_id` directly through the store.
pub fn enroll_endpoint(state: &AppState, tenant_id: &str, machine_id: &str) -> String {
    let token = state
        .store
        .create_enrollment_token(tenant_id, std::time::Duration::from_secs(3600))
        .expect("enrollment token");
    state
        .store
        .enroll(&token, machine_id, machine_id, "Test OS 1.0")
        .expect("enroll")
        .endpoint_id
}

pub fn assign_tenant(state: &AppState, operator: &OperatorRecord, tenant_id: &str) {
    state
        .store
        .assign(&operator.id, &Assignment::Tenant(tenant_id.to_string()))
        .expect("assign");
}

/// Stand-in for the DNS flush so tests observe the call without touching the
/// host resolver.
pub struct RecordingFlush {
    pub calls: Arc<std::sync::atomic::AtomicUsize>,
}

impl RemediationAction for RecordingFlush {
    fn id(&self) -> &'static str {
        "flush_dns"
    }
    fn requires_elevation(&self) -> bool {
        false
    }
    fn parameter(&self) -> Option<&'static str> {
        None
    }
    fn run<'a>(&'a self, _parameter: Option<&'a str>) -> BoxFuture<'a, anyhow::Result<ActionOutput>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Box::pin(async { Ok(ActionOutput::new("DNS cache flushed", "")) })
    }
}

pub struct TestAgent {
    pub runtime: Arc<AgentRuntime>,
    pub link: Arc<AgentLink>,
    pub flush_calls: Arc<std::sync::atomic::AtomicUsize>,
    pub shutdown: CancellationToken,
    /// Subscribed before the agent starts serving, so nothing it sends on
    /// connect is missed.
    pub terminal_events: broadcast::Receiver<TerminalEvent>,
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.link.close();
    }
}

pub fn test_runtime(staging: &Path, terminal: TerminalSession) -> (Arc<AgentRuntime>, Arc<std::sync::atomic::AtomicUsize>) {
    test_runtime_with(staging, terminal, Elevation::NotElevated)
}

pub fn test_runtime_with(
    staging: &Path,
    terminal: TerminalSession,
    elevation: Elevation,
) -> (Arc<AgentRuntime>, Arc<std::sync::atomic::AtomicUsize>) {
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let catalog = Arc::new(ActionCatalog::builtin());
    let mut dispatcher = RemediationDispatcher::new(catalog.clone(), elevation);
    dispatcher
        .register(RecordingFlush { calls: calls.clone() })
        .expect("register flush");
    let runtime = Arc::new(AgentRuntime::new(
        catalog,
        CommandValidator::new(staging),
        ProcessRunner::new(),
        dispatcher,
        terminal,
    ));
    (runtime, calls)
}

/// Attach an in-process agent for `endpoint_id`, wired to the relay without a
/// socket: the link's outbound queue feeds the runtime and the runtime's
/// replies are delivered back to the link.
pub fn connect_agent(state: &AppState, endpoint_id: &str, staging: &Path) -> TestAgent {
    connect_agent_with_terminal(state, endpoint_id, staging, TerminalSession::new())
}

pub fn connect_agent_with_terminal(
    state: &AppState,
    endpoint_id: &str,
    staging: &Path,
    terminal: TerminalSession,
) -> TestAgent {
    let (runtime, flush_calls) = test_runtime(staging, terminal);
    attach_runtime(state, endpoint_id, runtime, flush_calls)
}

/// Connect an existing runtime under a fresh link, as a reconnecting agent
/// would.
pub fn attach_runtime(
    state: &AppState,
    endpoint_id: &str,
    runtime: Arc<AgentRuntime>,
    flush_calls: Arc<std::sync::atomic::AtomicUsize>,
) -> TestAgent {
    let (link, inbound) = AgentLink::new(endpoint_id);
    let terminal_events = link.subscribe_terminal();
    state.agents.insert(link.clone());

    let (reply_tx, mut reply_rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    tokio::spawn(runtime.clone().serve(inbound, reply_tx, shutdown.clone()));
    let relay_side = link.clone();
    tokio::spawn(async move {
        while let Some(msg) = reply_rx.recv().await {
            relay_side.deliver(msg);
        }
    });

    TestAgent {
        runtime,
        link,
        flush_calls,
        shutdown,
        terminal_events,
    }
}

/// Whether `pid` is still running. A zombie counts as gone.
#[cfg(unix)]
pub fn is_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        stat.rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| !matches!(state, 'Z' | 'X'))
    }
    #[cfg(not(target_os = "linux"))]
    {
        // SAFETY: signal 0 only checks that the process exists.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
}

/// Poll until a script has written its pid to `path`.
pub async fn wait_for_pid_file(path: &Path) -> u32 {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let pid = std::fs::read_to_string(path)
                .ok()
                .and_then(|text| text.trim().parse().ok());
            if let Some(pid) = pid {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("script should record its background pid")
}

/// Poll until `pid` is gone. Returns `false` if it is still running after
/// five seconds.
#[cfg(unix)]
pub async fn wait_for_exit(pid: u32) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while is_running(pid) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

pub fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}

/// Send one request through a fresh clone of `app`.
pub async fn call(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}
