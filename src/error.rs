use crate::engine::EngineError;
use crate::gateway::frames::ServerFrame;

/// Failures reported to the client as `error` frames. None of them close the
/// connection.
#[derive(Debug)]
pub enum ProtocolError {
    InvalidFrame(String),
    NotBound,
    TurnInProgress,
    NoActiveTurn,
    /// The session was reclaimed while its socket was still open.
    SessionClosed,
    Engine(EngineError),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidFrame(_) => "invalid_frame",
            ProtocolError::NotBound => "not_bound",
            ProtocolError::TurnInProgress => "turn_in_progress",
            ProtocolError::NoActiveTurn => "no_active_turn",
            ProtocolError::SessionClosed => "session_closed",
            ProtocolError::Engine(_) => "engine_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProtocolError::InvalidFrame(e) => format!("malformed frame: {e}"),
            ProtocolError::NotBound => "no conversation is bound to this session".to_string(),
            ProtocolError::TurnInProgress => "a turn is already streaming".to_string(),
            ProtocolError::NoActiveTurn => "no turn is streaming".to_string(),
            ProtocolError::SessionClosed => "session is no longer registered".to_string(),
            ProtocolError::Engine(e) => e.to_string(),
        }
    }

    pub fn into_frame(self) -> ServerFrame {
        ServerFrame::Error {
            code: self.code().to_string(),
            message: self.message(),
        }
    }
}

impl From<EngineError> for ProtocolError {
    fn from(e: EngineError) -> Self {
        ProtocolError::Engine(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidFrame(e.to_string())
    }
}
