use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::frames::ServerFrame;
use super::registry::SessionRegistry;
use super::session::SocketHandle;
use crate::engine::{CompletionEngine, FragmentStream};
use crate::error::ProtocolError;

/// A turn being relayed from the engine to one socket.
pub struct ActiveTurn {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ActiveTurn {
    /// Relay `fragments` as `message:delta` frames until the stream ends,
    /// fails, or the turn is cancelled. The session is marked idle before the
    /// terminal frame goes out so the client can start the next turn at once.
    pub fn spawn(
        session_id: String,
        sessions: SessionRegistry,
        handle: SocketHandle,
        mut fragments: FragmentStream,
    ) -> Self {
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let terminal = loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => break ServerFrame::MessageCancelled {},
                    next = fragments.next() => match next {
                        Some(Ok(chunk)) => {
                            sessions.touch(&session_id);
                            if !handle.send(ServerFrame::MessageDelta { chunk }) {
                                sessions.mark_idle(&session_id);
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!("turn for session {session_id} failed mid-stream: {e}");
                            break ProtocolError::Engine(e).into_frame();
                        }
                        None => break ServerFrame::MessageDone {},
                    },
                }
            };
            sessions.mark_idle(&session_id);
            handle.send(terminal);
        });
        Self { cancel, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the engine to stop and end the relay with `message:cancelled`.
    /// Returns false if the turn had already ended.
    pub async fn cancel(self, session_id: &str, engine: &Arc<dyn CompletionEngine>) -> bool {
        if self.task.is_finished() {
            return false;
        }
        engine.cancel_turn(session_id).await;
        if self.cancel.send(()).is_err() {
            return false;
        }
        let _ = self.task.await;
        true
    }

    /// Stop relaying without emitting anything. Used when the socket is gone.
    pub fn abort(self) {
        self.task.abort();
    }
}
