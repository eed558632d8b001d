//! Boundary to the completion engine that produces assistant responses.
//!
//! The engine is an external collaborator. The gateway only needs to start a
//! turn, cancel it, and release whatever the engine keeps per session.

pub mod echo;
pub mod remote;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;

pub use echo::EchoEngine;
pub use remote::RemoteEngine;

/// Lazily produced response fragments for one turn.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

#[derive(Debug)]
pub enum EngineError {
    Http(reqwest::Error),
    Upstream { status: u16, body: String },
    Unavailable(String),
    Stream(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Http(e) => write!(f, "HTTP error: {e}"),
            EngineError::Upstream { status, body } => {
                write!(f, "engine returned {status}: {body}")
            }
            EngineError::Unavailable(msg) => write!(f, "engine unavailable: {msg}"),
            EngineError::Stream(msg) => write!(f, "stream error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Http(e)
    }
}

/// One conversation turn handed to the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub session_id: String,
    pub conversation_id: String,
    pub input: String,
}

#[async_trait]
pub trait CompletionEngine: Send + Sync {
    /// Prepare the engine. A failure here aborts server startup.
    async fn initialize(&self) -> Result<(), EngineError>;

    /// Start a turn and return its fragments. Dropping the stream stops
    /// consumption but does not by itself tell the engine to stop work.
    async fn start_turn(&self, turn: TurnRequest) -> Result<FragmentStream, EngineError>;

    /// Cooperative cancellation of the turn running for `session_id`.
    async fn cancel_turn(&self, session_id: &str);

    /// Free per-session resources after the session is gone.
    async fn release_session(&self, session_id: &str);

    async fn shutdown(&self);
}
