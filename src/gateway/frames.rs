use serde::{Deserialize, Serialize};

/// Frames sent by the client. Tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    StartTurn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        input: String,
    },
    Cancel {},
    Ping {},
}

/// Frames sent by the server. `session:idle` is always the first one on a
/// socket and is the client's only confirmation that the session exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "session:idle", rename_all = "camelCase")]
    SessionIdle { session_id: String },
    #[serde(rename = "message:delta")]
    MessageDelta { chunk: String },
    #[serde(rename = "message:done")]
    MessageDone {},
    #[serde(rename = "message:cancelled")]
    MessageCancelled {},
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "pong")]
    Pong {},
}

impl ServerFrame {
    /// Frames that end a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServerFrame::MessageDone {} | ServerFrame::MessageCancelled {} | ServerFrame::Error { .. }
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const SESSION_TIMED_OUT: u16 = 4009;
}
