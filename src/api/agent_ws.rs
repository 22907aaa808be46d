//! `GET /agent/ws`: the agent's side of its link.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::error::ApiError;
use super::AppState;
use crate::agent::connection::{ENDPOINT_ID_HEADER, ENDPOINT_SECRET_HEADER};
use crate::link::AgentLink;
use crate::protocol::{self, AgentToRelay, RelayToAgent, MAX_MESSAGE_BYTES};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

pub(super) async fn agent_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let (Some(endpoint_id), Some(secret)) = (
        header(&headers, ENDPOINT_ID_HEADER),
        header(&headers, ENDPOINT_SECRET_HEADER),
    ) else {
        return Err(ApiError::AuthRequired);
    };
    if !state.store.verify_endpoint_secret(endpoint_id, secret)? {
        tracing::warn!(endpoint = endpoint_id, "agent presented invalid credentials");
        return Err(ApiError::AuthInvalid);
    }

    // Credentials are checked before the upgrade headers.
    let ws = ws.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let endpoint_id = endpoint_id.to_string();
    Ok(ws
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| serve_agent(state, endpoint_id, socket)))
}

async fn serve_agent(state: AppState, endpoint_id: String, socket: WebSocket) {
    let (link, outbound) = AgentLink::new(endpoint_id.clone());
    state.agents.insert(link.clone());
    if let Err(e) = state.store.set_connected(&endpoint_id, true) {
        tracing::warn!(endpoint = %endpoint_id, error = %e, "failed to record connect");
    }
    tracing::info!(endpoint = %endpoint_id, "agent connected");

    pump(socket, &link, outbound).await;

    link.close();
    // A newer connection may already have replaced this one.
    if state.agents.remove(&link) {
        if let Err(e) = state.store.set_connected(&endpoint_id, false) {
            tracing::warn!(endpoint = %endpoint_id, error = %e, "failed to record disconnect");
        }
    }
    tracing::info!(endpoint = %endpoint_id, "agent disconnected");
}

async fn pump(socket: WebSocket, link: &Arc<AgentLink>, mut outbound: mpsc::Receiver<RelayToAgent>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match protocol::decode::<AgentToRelay>(text.as_str()) {
                    Ok(msg) => link.deliver(msg),
                    Err(e) => tracing::warn!(
                        endpoint = %link.endpoint_id(),
                        error = %e,
                        "dropping malformed agent message"
                    ),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(endpoint = %link.endpoint_id(), error = %e, "agent socket error");
                    break;
                }
            },
            request = outbound.recv() => {
                let Some(request) = request else { break };
                match protocol::encode(&request) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode relay request"),
                }
            }
            _ = link.closed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
