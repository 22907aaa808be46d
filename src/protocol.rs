//! JSON messages exchanged over the agent WebSocket.
//!
//! Every text frame carries exactly one message. Relay requests carry a
//! `request_id`; the agent answers each with one [`AgentToRelay::Reply`]
//! bearing the same id. Terminal output and the end-of-session notice are
//! pushed unsolicited.

use serde::{Deserialize, Serialize};

use crate::remediation::RemediationResult;
use crate::runner::ExecutionResult;

/// Largest text frame either side accepts (1 MiB).
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayToAgent {
    Execute {
        request_id: u64,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    Remediate {
        request_id: u64,
        action_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameter: Option<String>,
    },
    TerminalStart {
        request_id: u64,
    },
    TerminalInput {
        request_id: u64,
        data: String,
    },
    TerminalStop {
        request_id: u64,
    },
}

impl RelayToAgent {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Execute { request_id, .. }
            | Self::Remediate { request_id, .. }
            | Self::TerminalStart { request_id }
            | Self::TerminalInput { request_id, .. }
            | Self::TerminalStop { request_id } => *request_id,
        }
    }

    /// Same message with a different id. The relay assigns ids when it
    /// sends.
    pub fn with_request_id(mut self, id: u64) -> Self {
        match &mut self {
            Self::Execute { request_id, .. }
            | Self::Remediate { request_id, .. }
            | Self::TerminalStart { request_id }
            | Self::TerminalInput { request_id, .. }
            | Self::TerminalStop { request_id } => *request_id = id,
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentToRelay {
    Reply { request_id: u64, body: ReplyBody },
    TerminalOutput { data: String },
    TerminalEnded { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    Execution(ExecutionResult),
    Remediation(RemediationResult),
    /// Terminal control outcome.
    Ack {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ReplyBody {
    pub fn accepted() -> Self {
        Self::Ack {
            accepted: true,
            error: None,
        }
    }

    pub fn refused(error: impl Into<String>) -> Self {
        Self::Ack {
            accepted: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(msg)?;
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(text)
}

pub fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, ProtocolError> {
    if text.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relay_messages_are_tagged_snake_case() {
        let msg = RelayToAgent::Remediate {
            request_id: 7,
            action_id: "flush_dns".into(),
            parameter: None,
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(value, json!({"type": "remediate", "request_id": 7, "action_id": "flush_dns"}));

        let start = encode(&RelayToAgent::TerminalStart { request_id: 1 }).unwrap();
        assert!(start.contains(r#""type":"terminal_start""#));
    }

    #[test]
    fn optional_fields_may_be_omitted() {
        let msg: RelayToAgent =
            decode(r#"{"type":"execute","request_id":3,"path":"C:\\staging\\a.msi"}"#).unwrap();
        assert_eq!(
            msg,
            RelayToAgent::Execute {
                request_id: 3,
                path: r"C:\staging\a.msi".into(),
                arguments: None,
                timeout_secs: None,
            }
        );
    }

    #[test]
    fn request_id_can_be_reassigned() {
        let msg = RelayToAgent::TerminalInput {
            request_id: 0,
            data: "ls".into(),
        }
        .with_request_id(42);
        assert_eq!(msg.request_id(), 42);
    }

    #[test]
    fn reply_body_carries_kind() {
        let reply = AgentToRelay::Reply {
            request_id: 9,
            body: ReplyBody::Execution(ExecutionResult::rejected("installer extension is not allowed")),
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&reply).unwrap()).unwrap();
        assert_eq!(value["type"], "reply");
        assert_eq!(value["body"]["kind"], "execution");
        assert_eq!(value["body"]["rejection"], "installer extension is not allowed");
        assert_eq!(value["body"]["success"], false);
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(decode::<RelayToAgent>(r#"{"type":"format_disk","request_id":1}"#).is_err());
        assert!(decode::<AgentToRelay>("not json").is_err());
    }

    #[test]
    fn oversized_message_rejected() {
        let big = "x".repeat(MAX_MESSAGE_BYTES + 1);
        assert!(matches!(decode::<AgentToRelay>(&big), Err(ProtocolError::TooLarge(_))));
    }
}
