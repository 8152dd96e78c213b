//! Container subprocess protocol.
//!
//! Host → container: one `AgentInput` JSON object on stdin for the first
//! turn; follow-up turns are further line-delimited `TurnRequest` objects
//! while stdin stays open.
//!
//! Container → host: line-delimited `AgentRecord` JSON on stdout. Anything
//! on stdout that is not a parseable record line is logged and ignored.

use serde::{Deserialize, Serialize};

/// First-turn payload written to container stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub chat_jid: String,
    pub folder: String,
    pub is_main: bool,
    pub assistant_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
}

/// Follow-up turn piped to a live container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub prompt: String,
}

/// One stdout record from the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentRecord {
    Message {
        text: String,
    },
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Error {
        error: String,
    },
    Done {},
}

/// Structured event delivered to an output-router subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Message { text: String },
    Error { error: String },
    Done { session_id: Option<String> },
}

impl AgentEvent {
    /// Terminal events end the subscriber's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Error { .. } | AgentEvent::Done { .. })
    }
}

/// Strip `<internal>...</internal>` blocks the agent uses for hidden
/// reasoning. An unclosed tag strips to end of input.
pub fn strip_internal_blocks(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("<internal>") {
        result.push_str(&rest[..start]);
        if let Some(end) = rest[start..].find("</internal>") {
            rest = &rest[start + end + "</internal>".len()..];
        } else {
            rest = "";
            break;
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}
