//! `GET /api/endpoints/{id}/terminal/ws`: live terminal output for operators.
//!
//! Server → client frames are JSON: `{"type":"output","data":...}` batches
//! and `{"type":"ended","exit_code":...}`. Clients may send
//! `{"type":"input","data":...}`, which is forwarded like
//! `POST .../terminal/input`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    Extension,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::error::ApiError;
use super::handlers::authorize_endpoint;
use super::AppState;
use crate::identity::Principal;
use crate::link::AgentLink;
use crate::terminal::TerminalEvent;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Output { data: String },
    Ended { exit_code: i32 },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Input { data: String },
}

impl From<TerminalEvent> for ServerFrame {
    fn from(event: TerminalEvent) -> Self {
        match event {
            TerminalEvent::Output(data) => ServerFrame::Output { data },
            TerminalEvent::Ended { exit_code } => ServerFrame::Ended { exit_code },
        }
    }
}

pub(super) async fn terminal_ws(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(endpoint_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let link = authorize_endpoint(&state, &principal, &endpoint_id)?;
    // Subscribe before the upgrade so nothing emitted in between is lost.
    let events = link.subscribe_terminal();
    tracing::info!(operator = %principal.id, endpoint = %endpoint_id, "terminal viewer attached");
    Ok(ws.on_upgrade(move |socket| stream_terminal(socket, link, events)))
}

async fn send_frame(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text.into())).await.is_ok(),
        Err(_) => true,
    }
}

async fn stream_terminal(
    socket: WebSocket,
    link: Arc<AgentLink>,
    mut events: broadcast::Receiver<TerminalEvent>,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if !send_frame(&mut sink, &event.into()).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(endpoint = %link.endpoint_id(), skipped = n, "terminal viewer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(ClientFrame::Input { data }) => match link.terminal_input(data).await {
                            Ok(()) => continue,
                            Err(e) => ServerFrame::Error { message: e.to_string() },
                        },
                        Err(e) => ServerFrame::Error { message: format!("invalid frame: {e}") },
                    };
                    if !send_frame(&mut sink, &frame).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            _ = link.closed() => {
                let _ = send_frame(&mut sink, &ServerFrame::Error {
                    message: "endpoint disconnected".into(),
                }).await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged() {
        let out = serde_json::to_value(ServerFrame::from(TerminalEvent::Output("hi\n".into()))).unwrap();
        assert_eq!(out, serde_json::json!({"type": "output", "data": "hi\n"}));
        let end = serde_json::to_value(ServerFrame::from(TerminalEvent::Ended { exit_code: -1 })).unwrap();
        assert_eq!(end, serde_json::json!({"type": "ended", "exit_code": -1}));
        let input: ClientFrame = serde_json::from_str(r#"{"type":"input","data":"ls"}"#).unwrap();
        assert!(matches!(input, ClientFrame::Input { data } if data == "ls"));
    }
}
