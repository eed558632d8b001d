pub mod frames;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod turn;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::engine::TurnRequest;
use crate::error::ProtocolError;
use crate::state::AppState;
use frames::{close_code, ClientFrame, ServerFrame};
use registry::StreamStart;
use session::{Outbound, SocketHandle};
use turn::ActiveTurn;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub conversation_id: Option<String>,
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.conversation_id))
}

/// Per-connection state the handler keeps between frames. Everything else
/// lives in the registry.
struct Connection {
    session_id: String,
    handle: SocketHandle,
    turn: Option<ActiveTurn>,
}

async fn handle_socket(socket: WebSocket, state: AppState, conversation_id: Option<String>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Channel for everything written to this socket after the confirmation
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = SocketHandle::new(tx);
    let session_id = state.sessions.register(handle.clone());
    if let Some(ref conversation_id) = conversation_id {
        state.sessions.bind_conversation(&session_id, conversation_id);
    }
    tracing::debug!("session {session_id} opened");

    let confirm = ServerFrame::SessionIdle {
        session_id: session_id.clone(),
    };
    let mut conn = Connection {
        session_id,
        handle,
        turn: None,
    };

    if ws_sink
        .send(Message::Text(confirm.to_json().into()))
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                Some(out) = rx.recv() => {
                    match out {
                        Outbound::Frame(frame) => {
                            if ws_sink.send(Message::Text(frame.to_json().into())).await.is_err() {
                                break;
                            }
                        }
                        Outbound::Close { code, reason } => {
                            tracing::debug!("closing session {} ({code}: {reason})", conn.session_id);
                            let _ = ws_sink
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                    }
                }
                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            state.sessions.touch(&conn.session_id);
                            if let Err(e) = handle_frame(&state, &mut conn, text.as_str()).await {
                                conn.handle.send(e.into_frame());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            tracing::debug!("session {} socket error: {e}", conn.session_id);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    // Cleanup: stop any in-flight turn and drop the session
    if let Some(turn) = conn.turn.take() {
        if !turn.is_finished() {
            state.engine.cancel_turn(&conn.session_id).await;
        }
        turn.abort();
    }
    if state.sessions.remove(&conn.session_id).is_some() {
        state.engine.release_session(&conn.session_id).await;
    }
    tracing::debug!("session {} closed", conn.session_id);
}

async fn handle_frame(
    state: &AppState,
    conn: &mut Connection,
    text: &str,
) -> Result<(), ProtocolError> {
    match serde_json::from_str::<ClientFrame>(text)? {
        ClientFrame::Ping {} => {
            conn.handle.send(ServerFrame::Pong {});
            Ok(())
        }
        ClientFrame::StartTurn {
            conversation_id,
            input,
        } => start_turn(state, conn, conversation_id, input).await,
        ClientFrame::Cancel {} => {
            let cancelled = match conn.turn.take() {
                Some(turn) => turn.cancel(&conn.session_id, &state.engine).await,
                None => false,
            };
            if cancelled {
                Ok(())
            } else {
                Err(ProtocolError::NoActiveTurn)
            }
        }
    }
}

async fn start_turn(
    state: &AppState,
    conn: &mut Connection,
    conversation_id: Option<String>,
    input: String,
) -> Result<(), ProtocolError> {
    let session_id = conn.session_id.clone();
    if !state.sessions.contains(&session_id) {
        return Err(ProtocolError::SessionClosed);
    }
    if let Some(ref conversation_id) = conversation_id {
        state.sessions.bind_conversation(&session_id, conversation_id);
    }
    let conversation_id = state
        .sessions
        .conversation_of(&session_id)
        .ok_or(ProtocolError::NotBound)?;

    match state.sessions.mark_streaming(&session_id) {
        StreamStart::Started => {}
        StreamStart::AlreadyStreaming => return Err(ProtocolError::TurnInProgress),
        StreamStart::Gone => return Err(ProtocolError::SessionClosed),
    }

    let request = TurnRequest {
        session_id: session_id.clone(),
        conversation_id,
        input,
    };
    let fragments = match state.engine.start_turn(request).await {
        Ok(fragments) => fragments,
        Err(e) => {
            tracing::warn!("engine refused turn for session {session_id}: {e}");
            state.sessions.mark_idle(&session_id);
            return Err(e.into());
        }
    };

    conn.turn = Some(ActiveTurn::spawn(
        session_id,
        state.sessions.clone(),
        conn.handle.clone(),
        fragments,
    ));
    Ok(())
}

/// Close every live session, e.g. on shutdown. Returns how many were closed.
pub fn close_all(state: &AppState) -> usize {
    let drained = state.sessions.drain();
    for (session_id, handle) in &drained {
        if let Err(e) = handle.close(close_code::GOING_AWAY, "server shutting down") {
            tracing::debug!("session {session_id} already gone: {e}");
        }
    }
    drained.len()
}
