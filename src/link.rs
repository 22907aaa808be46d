//! Relay-side view of connected agents.
//!
//! An [`AgentLink`] multiplexes concurrent requests to one agent over its
//! WebSocket by request id. The [`AgentRegistry`] maps endpoint ids to their
//! current link; a reconnecting agent replaces its previous link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::protocol::{AgentToRelay, RelayToAgent, ReplyBody};
use crate::remediation::RemediationResult;
use crate::runner::{ExecutionResult, TimeoutBounds};
use crate::terminal::TerminalEvent;

/// Added to the agent-side deadline before the relay gives up on a reply.
pub const REPLY_MARGIN: Duration = Duration::from_secs(15);
/// Deadline for remediation replies.
pub const REMEDIATION_TIMEOUT: Duration = Duration::from_secs(180);
/// Deadline for terminal control replies.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);

const OUTBOUND_CAPACITY: usize = 64;
const TERMINAL_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("endpoint is not connected")]
    Disconnected,
    #[error("endpoint did not reply in time")]
    Timeout,
    #[error("endpoint sent an unexpected reply")]
    UnexpectedReply,
    #[error("endpoint refused: {0}")]
    Refused(String),
}

pub struct AgentLink {
    endpoint_id: String,
    outbound: mpsc::Sender<RelayToAgent>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyBody>>>,
    next_id: AtomicU64,
    terminal: broadcast::Sender<TerminalEvent>,
    closed: CancellationToken,
}

impl std::fmt::Debug for AgentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLink")
            .field("endpoint_id", &self.endpoint_id)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AgentLink {
    /// Create a link and the receiver its socket writer drains.
    pub fn new(endpoint_id: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<RelayToAgent>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (terminal, _) = broadcast::channel(TERMINAL_EVENT_CAPACITY);
        let link = Arc::new(Self {
            endpoint_id: endpoint_id.into(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            terminal,
            closed: CancellationToken::new(),
        });
        (link, rx)
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the link is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn subscribe_terminal(&self) -> broadcast::Receiver<TerminalEvent> {
        self.terminal.subscribe()
    }

    /// Route one inbound message from the agent.
    pub fn deliver(&self, msg: AgentToRelay) {
        match msg {
            AgentToRelay::Reply { request_id, body } => {
                let waiter = self.pending.lock().remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => tracing::debug!(
                        endpoint = %self.endpoint_id,
                        request_id,
                        "reply for unknown or expired request"
                    ),
                }
            }
            AgentToRelay::TerminalOutput { data } => {
                let _ = self.terminal.send(TerminalEvent::Output(data));
            }
            AgentToRelay::TerminalEnded { exit_code } => {
                let _ = self.terminal.send(TerminalEvent::Ended { exit_code });
            }
        }
    }

    /// Fail every in-flight request and refuse new ones.
    pub fn close(&self) {
        self.closed.cancel();
        self.pending.lock().clear();
    }

    /// Send `msg` under a fresh request id and wait for its reply.
    pub async fn request(&self, msg: RelayToAgent, timeout: Duration) -> Result<ReplyBody, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.outbound.send(msg.with_request_id(id)).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(LinkError::Disconnected);
        }

        let outcome = tokio::select! {
            reply = tokio::time::timeout(timeout, rx) => match reply {
                Ok(Ok(body)) => Ok(body),
                Ok(Err(_)) => Err(LinkError::Disconnected),
                Err(_) => Err(LinkError::Timeout),
            },
            _ = self.closed.cancelled() => Err(LinkError::Disconnected),
        };
        if outcome.is_err() {
            self.pending.lock().remove(&id);
        }
        outcome
    }

    pub async fn execute(
        &self,
        path: String,
        arguments: Option<String>,
        timeout_secs: Option<u64>,
    ) -> Result<ExecutionResult, LinkError> {
        let deadline = TimeoutBounds::default().clamp(timeout_secs) + REPLY_MARGIN;
        let msg = RelayToAgent::Execute {
            request_id: 0,
            path,
            arguments,
            timeout_secs,
        };
        match self.request(msg, deadline).await? {
            ReplyBody::Execution(result) => Ok(result),
            _ => Err(LinkError::UnexpectedReply),
        }
    }

    pub async fn remediate(
        &self,
        action_id: String,
        parameter: Option<String>,
    ) -> Result<RemediationResult, LinkError> {
        let msg = RelayToAgent::Remediate {
            request_id: 0,
            action_id,
            parameter,
        };
        match self.request(msg, REMEDIATION_TIMEOUT).await? {
            ReplyBody::Remediation(result) => Ok(result),
            _ => Err(LinkError::UnexpectedReply),
        }
    }

    async fn control(&self, msg: RelayToAgent) -> Result<(), LinkError> {
        match self.request(msg, CONTROL_TIMEOUT).await? {
            ReplyBody::Ack { accepted: true, .. } => Ok(()),
            ReplyBody::Ack { error, .. } => Err(LinkError::Refused(
                error.unwrap_or_else(|| "request refused".to_string()),
            )),
            _ => Err(LinkError::UnexpectedReply),
        }
    }

    pub async fn terminal_start(&self) -> Result<(), LinkError> {
        self.control(RelayToAgent::TerminalStart { request_id: 0 }).await
    }

    pub async fn terminal_input(&self, data: String) -> Result<(), LinkError> {
        self.control(RelayToAgent::TerminalInput { request_id: 0, data }).await
    }

    pub async fn terminal_stop(&self) -> Result<(), LinkError> {
        self.control(RelayToAgent::TerminalStop { request_id: 0 }).await
    }
}

/// Connected agents by endpoint id. Cheap to clone.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    links: Arc<RwLock<HashMap<String, Arc<AgentLink>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `link`, closing any link it replaces.
    pub fn insert(&self, link: Arc<AgentLink>) {
        let previous = self
            .links
            .write()
            .insert(link.endpoint_id().to_string(), link.clone());
        if let Some(old) = previous {
            tracing::info!(endpoint = %link.endpoint_id(), "agent reconnected, closing previous link");
            old.close();
        }
    }

    pub fn get(&self, endpoint_id: &str) -> Option<Arc<AgentLink>> {
        self.links.read().get(endpoint_id).cloned()
    }

    /// Remove `link` if it is still the current one for its endpoint.
    /// Returns whether it was removed.
    pub fn remove(&self, link: &Arc<AgentLink>) -> bool {
        let mut links = self.links.write();
        match links.get(link.endpoint_id()) {
            Some(current) if Arc::ptr_eq(current, link) => {
                links.remove(link.endpoint_id());
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, endpoint_id: &str) -> bool {
        self.links.read().contains_key(endpoint_id)
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }
}
