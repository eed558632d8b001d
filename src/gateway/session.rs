use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::frames::ServerFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// The engine is producing a turn for this session. Never reclaimed.
    Streaming,
}

/// Instruction delivered to the task that owns a socket.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

/// Returned when the connection task behind a handle has already ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketGone;

impl fmt::Display for SocketGone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket already closed")
    }
}

impl std::error::Error for SocketGone {}

/// Owned handle for one live socket. Frames and close requests are queued to
/// the connection task, which is the only writer on the socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: ServerFrame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn close(&self, code: u16, reason: &str) -> Result<(), SocketGone> {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| SocketGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// True when both handles feed the same connection task.
    pub fn same_socket(&self, other: &SocketHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// One live real-time session.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub last_activity_at: Instant,
    pub state: SessionState,
    pub handle: SocketHandle,
}

impl Session {
    pub fn new(session_id: String, handle: SocketHandle) -> Self {
        Self {
            session_id,
            conversation_id: None,
            last_activity_at: Instant::now(),
            state: SessionState::Idle,
            handle,
        }
    }

    pub fn is_reclaimable(&self, threshold: std::time::Duration, now: Instant) -> bool {
        self.state == SessionState::Idle
            && now.saturating_duration_since(self.last_activity_at) > threshold
    }
}
