use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use super::AgentRuntime;
use crate::protocol::{self, AgentToRelay, RelayToAgent};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub const ENDPOINT_ID_HEADER: &str = "x-endpoint-id";
pub const ENDPOINT_SECRET_HEADER: &str = "x-endpoint-secret";

const PING_INTERVAL: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const CHANNEL_CAPACITY: usize = 64;

/// Credentials issued at enrollment.
#[derive(Clone)]
pub struct EndpointCredentials {
    pub endpoint_id: String,
    pub endpoint_secret: String,
}

impl std::fmt::Debug for EndpointCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCredentials")
            .field("endpoint_id", &self.endpoint_id)
            .finish_non_exhaustive()
    }
}

/// A persistent WebSocket connection to the relay.
///
/// Spawns a tokio task that:
/// - Connects to `{server}/agent/ws` with the endpoint id and secret headers
/// - Feeds relay requests to the [`AgentRuntime`] and sends back its replies
/// - Pings every 30s
/// - On disconnect, retries with exponential backoff (1s..60s)
/// - Gives up for good if the relay rejects the credentials
pub struct RelayConnection {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RelayConnection {
    pub fn spawn(server_url: &str, credentials: EndpointCredentials, runtime: Arc<AgentRuntime>) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(connection_loop(
            agent_ws_url(server_url),
            credentials,
            runtime,
            shutdown_rx,
        ));
        Self { shutdown_tx, task }
    }

    /// Signal the connection task to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the connection task to complete. Consumes the handle.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!("relay connection task panicked");
            }
        }
    }
}

/// `http(s)://host[:port]/` → `ws(s)://host[:port]/agent/ws`.
pub fn agent_ws_url(server_url: &str) -> String {
    let base = server_url.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!("{base}/agent/ws")
}

fn build_request(ws_url: &str, credentials: &EndpointCredentials) -> Result<Request<()>, tungstenite::Error> {
    let mut request = ws_url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        ENDPOINT_ID_HEADER,
        HeaderValue::from_str(&credentials.endpoint_id).map_err(tungstenite::http::Error::from)?,
    );
    headers.insert(
        ENDPOINT_SECRET_HEADER,
        HeaderValue::from_str(&credentials.endpoint_secret).map_err(tungstenite::http::Error::from)?,
    );
    Ok(request)
}

fn is_credential_rejection(error: &tungstenite::Error) -> bool {
    match error {
        tungstenite::Error::Http(response) => {
            matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        }
        _ => false,
    }
}

async fn connection_loop(
    ws_url: String,
    credentials: EndpointCredentials,
    runtime: Arc<AgentRuntime>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    reconnect_loop(&ws_url, &credentials, &runtime, &mut shutdown_rx).await;
    // A lost or refused connection leaves in-flight work running; an
    // explicit shutdown does not.
    let shutting_down = *shutdown_rx.borrow();
    if shutting_down {
        runtime.halt().await;
    }
}

async fn reconnect_loop(
    ws_url: &str,
    credentials: &EndpointCredentials,
    runtime: &Arc<AgentRuntime>,
    shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let connect_result = match build_request(ws_url, credentials) {
            Ok(request) => tokio_tungstenite::connect_async(request).await,
            Err(e) => {
                tracing::error!(url = %ws_url, error = %e, "invalid relay connection request");
                return;
            }
        };

        match connect_result {
            Ok((ws_stream, _)) => {
                backoff = INITIAL_BACKOFF;
                tracing::info!(url = %ws_url, endpoint = %credentials.endpoint_id, "connected to relay");

                run_connection(ws_stream, runtime.clone(), shutdown_rx).await;

                if *shutdown_rx.borrow() {
                    return;
                }
                tracing::warn!(url = %ws_url, "relay disconnected");
            }
            Err(e) if is_credential_rejection(&e) => {
                tracing::error!(
                    url = %ws_url,
                    endpoint = %credentials.endpoint_id,
                    "relay rejected endpoint credentials; re-enroll this agent"
                );
                return; // Permanent: retrying the same secret cannot succeed.
            }
            Err(e) => {
                tracing::debug!(url = %ws_url, error = %e, "connection failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => { return; }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_connection(
    ws_stream: WsStream,
    runtime: Arc<AgentRuntime>,
    shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = ws_stream.split();
    let (request_tx, request_rx) = mpsc::channel::<RelayToAgent>(CHANNEL_CAPACITY);
    let (reply_tx, mut reply_rx) = mpsc::channel::<AgentToRelay>(CHANNEL_CAPACITY);
    let serve_cancel = CancellationToken::new();
    let server = tokio::spawn(runtime.serve(request_rx, reply_tx, serve_cancel.clone()));

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match protocol::decode::<RelayToAgent>(text.as_str()) {
                            Ok(request) => {
                                if request_tx.send(request).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "dropping malformed relay message"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "relay socket error");
                        break;
                    }
                }
            }
            reply = reply_rx.recv() => {
                let Some(reply) = reply else { break };
                match protocol::encode(&reply) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode reply"),
                }
            }
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // In-flight requests keep running and the terminal session survives the
    // reconnect; only the replies for this socket are dropped.
    serve_cancel.cancel();
    drop(request_tx);
    drop(reply_rx);
    if let Err(e) = server.await {
        if e.is_panic() {
            tracing::error!("agent request loop panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ActionCatalog;
    use crate::protocol::ReplyBody;
    use crate::remediation::{ActionOutput, Elevation, RemediationAction, RemediationDispatcher};
    use crate::runner::ProcessRunner;
    use crate::terminal::TerminalSession;
    use crate::validator::CommandValidator;
    use futures::future::BoxFuture;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request as HsRequest, Response};

    struct Flush;

    impl RemediationAction for Flush {
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
            Box::pin(async { Ok(ActionOutput::new("DNS cache flushed", "")) })
        }
    }

    fn test_runtime() -> Arc<AgentRuntime> {
        let catalog = Arc::new(ActionCatalog::builtin());
        let mut dispatcher = RemediationDispatcher::new(catalog.clone(), Elevation::NotElevated);
        dispatcher.register(Flush).unwrap();
        Arc::new(AgentRuntime::new(
            catalog,
            CommandValidator::new(std::env::temp_dir()),
            ProcessRunner::new(),
            dispatcher,
            TerminalSession::new(),
        ))
    }

    fn credentials() -> EndpointCredentials {
        EndpointCredentials {
            endpoint_id: "ep-1".into(),
            endpoint_secret: "s3cret".into(),
        }
    }

    #[test]
    fn ws_url_from_server_url() {
        assert_eq!(agent_ws_url("http://relay:8080"), "ws://relay:8080/agent/ws");
        assert_eq!(agent_ws_url("https://relay.example/"), "wss://relay.example/agent/ws");
        assert_eq!(agent_ws_url("127.0.0.1:9"), "ws://127.0.0.1:9/agent/ws");
        assert_eq!(agent_ws_url("wss://r"), "wss://r/agent/ws");
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let dbg = format!("{:?}", credentials());
        assert!(dbg.contains("ep-1"));
        assert!(!dbg.contains("s3cret"));
    }

    #[tokio::test]
    async fn relays_requests_and_replies() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (hdr_tx, hdr_rx) = std::sync::mpsc::channel();
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, move |req: &HsRequest, resp: Response| {
                let id = req.headers().get(ENDPOINT_ID_HEADER).cloned();
                let secret = req.headers().get(ENDPOINT_SECRET_HEADER).cloned();
                let _ = hdr_tx.send((id, secret));
                Ok::<_, ErrorResponse>(resp)
            })
            .await
            .unwrap();
            let (id, secret) = hdr_rx.recv().unwrap();
            assert_eq!(id.unwrap(), "ep-1");
            assert_eq!(secret.unwrap(), "s3cret");

            let request = protocol::encode(&RelayToAgent::Remediate {
                request_id: 77,
                action_id: "flush_dns".into(),
                parameter: None,
            })
            .unwrap();
            ws.send(Message::Text(request.into())).await.unwrap();

            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return protocol::decode::<AgentToRelay>(text.as_str()).unwrap();
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended early: {other:?}"),
                }
            }
        });

        let conn = RelayConnection::spawn(&format!("http://{addr}"), credentials(), test_runtime());
        let reply = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("relay should receive a reply")
            .unwrap();
        match reply {
            AgentToRelay::Reply {
                request_id: 77,
                body: ReplyBody::Remediation(result),
            } => {
                assert!(result.success);
                assert_eq!(result.message, "DNS cache flushed");
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        conn.shutdown();
        tokio::time::timeout(Duration::from_secs(5), conn.join())
            .await
            .expect("connection should stop on shutdown");
    }

    #[tokio::test]
    async fn rejected_credentials_stop_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let _ = tokio_tungstenite::accept_hdr_async(tcp, |_: &HsRequest, _: Response| {
                let mut deny = ErrorResponse::new(None);
                *deny.status_mut() = StatusCode::UNAUTHORIZED;
                Err(deny)
            })
            .await;
        });

        let conn = RelayConnection::spawn(&format!("http://{addr}"), credentials(), test_runtime());
        tokio::time::timeout(Duration::from_secs(5), conn.join())
            .await
            .expect("loop should exit after a 401");
    }

    #[tokio::test]
    async fn shutdown_during_backoff() {
        // Nothing listens on this port; the loop sits in backoff.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = RelayConnection::spawn(&format!("http://{addr}"), credentials(), test_runtime());
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.shutdown();
        tokio::time::timeout(Duration::from_secs(2), conn.join())
            .await
            .expect("shutdown should interrupt backoff");
    }
}
