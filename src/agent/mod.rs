//! Endpoint side of the relay channel.
//!
//! [`AgentRuntime`] owns every process handle on the endpoint: the installer
//! runner, the remediation dispatcher and the single terminal session. It
//! consumes [`RelayToAgent`] requests and produces [`AgentToRelay`] replies
//! without knowing how they travel; [`connection`] carries them over the
//! relay WebSocket.

pub mod connection;
pub mod enroll;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::catalog::{ActionCatalog, INSTALL_SOFTWARE};
use crate::protocol::{AgentToRelay, RelayToAgent, ReplyBody};
use crate::remediation::{Elevation, RegistrationError, RemediationDispatcher};
use crate::runner::{ExecutionResult, ProcessRunner};
use crate::terminal::{TerminalEvent, TerminalSession};
use crate::validator::{CommandValidator, InstallerKind};

pub struct AgentRuntime {
    catalog: Arc<ActionCatalog>,
    validator: CommandValidator,
    runner: ProcessRunner,
    dispatcher: RemediationDispatcher,
    terminal: TerminalSession,
    /// Cancelled when the agent shuts down. In-flight requests outlive a
    /// relay connection but not this.
    halted: CancellationToken,
}

impl AgentRuntime {
    pub fn new(
        catalog: Arc<ActionCatalog>,
        validator: CommandValidator,
        runner: ProcessRunner,
        dispatcher: RemediationDispatcher,
        terminal: TerminalSession,
    ) -> Self {
        Self {
            catalog,
            validator,
            runner,
            dispatcher,
            terminal,
            halted: CancellationToken::new(),
        }
    }

    /// Runtime with the built-in catalog and actions, validating installers
    /// against `validator`.
    pub fn builtin(validator: CommandValidator, elevation: Elevation) -> Result<Self, RegistrationError> {
        let catalog = Arc::new(ActionCatalog::builtin());
        let runner = ProcessRunner::new();
        let dispatcher =
            RemediationDispatcher::with_builtin_actions(catalog.clone(), elevation, runner.clone())?;
        Ok(Self::new(catalog, validator, runner, dispatcher, TerminalSession::new()))
    }

    pub fn terminal(&self) -> &TerminalSession {
        &self.terminal
    }

    /// Abandon every in-flight request and stop the terminal session.
    ///
    /// Dropping a request kills whatever process tree it started. Call once
    /// the agent is shutting down; the runtime serves nothing afterwards.
    pub async fn halt(&self) {
        tracing::info!("halting agent runtime");
        self.halted.cancel();
        self.terminal.stop().await;
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_cancelled()
    }

    /// Validate and run a staged installer. Nothing is spawned unless every
    /// check passes.
    pub async fn execute(
        &self,
        path: &str,
        arguments: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> ExecutionResult {
        if !self.catalog.is_allowed(INSTALL_SOFTWARE) {
            return ExecutionResult::rejected("installer execution is not in the action catalog");
        }
        if !self.dispatcher.elevation().is_elevated() {
            return ExecutionResult::rejected(
                "installer execution requires elevated privileges; restart the agent as administrator",
            );
        }
        let canonical = match self.validator.validate(path) {
            Ok(p) => p,
            Err(rejection) => {
                tracing::warn!(path, reason = %rejection, "installer rejected");
                return ExecutionResult::rejected(rejection.to_string());
            }
        };
        let arguments = arguments.map(str::trim).filter(|a| !a.is_empty());
        if let Some(args) = arguments {
            if let Err(rejection) = self.validator.validate_arguments(args) {
                tracing::warn!(path, reason = %rejection, "installer arguments rejected");
                return ExecutionResult::rejected(rejection.to_string());
            }
        }
        let Some(kind) = InstallerKind::from_path(&canonical) else {
            return ExecutionResult::rejected("installer extension is not allowed");
        };

        tracing::info!(path = %canonical.display(), ?kind, "running installer");
        let result = self
            .runner
            .run_installer(&canonical, kind, arguments, timeout_secs)
            .await;
        tracing::info!(
            path = %canonical.display(),
            success = result.success,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms,
            "installer finished"
        );
        result
    }

    /// Answer one relay request.
    pub async fn handle(&self, msg: RelayToAgent) -> AgentToRelay {
        let request_id = msg.request_id();
        let body = match msg {
            RelayToAgent::Execute {
                path,
                arguments,
                timeout_secs,
                ..
            } => ReplyBody::Execution(self.execute(&path, arguments.as_deref(), timeout_secs).await),
            RelayToAgent::Remediate {
                action_id, parameter, ..
            } => ReplyBody::Remediation(
                self.dispatcher
                    .execute(&action_id, parameter.as_deref())
                    .await,
            ),
            RelayToAgent::TerminalStart { .. } => match self.terminal.start() {
                Ok(()) => ReplyBody::accepted(),
                Err(e) => ReplyBody::refused(e.to_string()),
            },
            RelayToAgent::TerminalInput { data, .. } => {
                if self.terminal.send_input(&data) {
                    ReplyBody::accepted()
                } else {
                    ReplyBody::refused("no active terminal session")
                }
            }
            RelayToAgent::TerminalStop { .. } => {
                self.terminal.stop().await;
                ReplyBody::accepted()
            }
        };
        AgentToRelay::Reply { request_id, body }
    }

    /// Serve one relay connection: requests from `inbound` until it closes
    /// or `stop` fires, replies and terminal events to `outbound`.
    ///
    /// Requests run concurrently; a slow installer does not hold up a
    /// terminal keystroke. When the connection goes away, requests still
    /// running are left to finish (their replies have nowhere to go) so a
    /// network blip does not cut an installer short. Only [`Self::halt`]
    /// abandons them.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<RelayToAgent>,
        outbound: mpsc::Sender<AgentToRelay>,
        stop: CancellationToken,
    ) {
        let forwarder_stop = stop.child_token();
        let forwarder = tokio::spawn(forward_terminal_events(
            self.terminal.clone(),
            outbound.clone(),
            forwarder_stop.clone(),
        ));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    let request_id = msg.request_id();
                    tracing::debug!(request_id, "relay request");
                    let runtime = self.clone();
                    let outbound = outbound.clone();
                    let halted = self.halted.clone();
                    tasks.spawn(async move {
                        tokio::select! {
                            reply = runtime.handle(msg) => {
                                if outbound.send(reply).await.is_err() {
                                    tracing::info!(request_id, "relay connection gone, reply dropped");
                                }
                            }
                            _ = halted.cancelled() => {
                                tracing::warn!(request_id, "request abandoned at shutdown");
                            }
                        }
                    });
                }
                Some(joined) = tasks.join_next() => log_join(joined),
                _ = stop.cancelled() => break,
                _ = self.halted.cancelled() => break,
            }
        }

        if self.is_halted() {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        } else {
            if !tasks.is_empty() {
                tracing::info!(in_flight = tasks.len(), "relay connection closed, letting requests finish");
            }
            tasks.detach_all();
        }
        forwarder_stop.cancel();
        if let Err(e) = forwarder.await {
            if e.is_panic() {
                tracing::error!("terminal forwarder panicked");
            }
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "request handler panicked");
        }
    }
}

/// Push terminal events to one relay connection.
///
/// A session can end while no connection is up. Ends are claimed from the
/// session rather than taken from the broadcast alone, so one that fired in
/// between connections is sent when the next one starts, and none is sent
/// twice.
async fn forward_terminal_events(
    terminal: TerminalSession,
    outbound: mpsc::Sender<AgentToRelay>,
    stop: CancellationToken,
) {
    let mut events = terminal.subscribe();
    while let Some(exit_code) = terminal.claim_end() {
        tracing::info!(exit_code, "reporting terminal session that ended while disconnected");
        if !send_end(&terminal, &outbound, exit_code).await {
            return;
        }
    }

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = stop.cancelled() => return,
        };
        match event {
            Ok(TerminalEvent::Output(data)) => {
                if outbound.send(AgentToRelay::TerminalOutput { data }).await.is_err() {
                    return;
                }
            }
            Ok(TerminalEvent::Ended { .. }) => {
                // Already reported by the replay above if unclaimed.
                let Some(exit_code) = terminal.claim_end() else { continue };
                if !send_end(&terminal, &outbound, exit_code).await {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "terminal output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Send a claimed end, handing it back to the session if the connection is
/// gone.
async fn send_end(terminal: &TerminalSession, outbound: &mpsc::Sender<AgentToRelay>, exit_code: i32) -> bool {
    if outbound.send(AgentToRelay::TerminalEnded { exit_code }).await.is_err() {
        terminal.unclaim_end(exit_code);
        return false;
    }
    true
}
