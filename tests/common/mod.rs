#![allow(dead_code)]

use async_trait::async_trait;
use chatlink::engine::{CompletionEngine, EngineError, FragmentStream, TurnRequest};
use chatlink::routes;
use chatlink::state::AppState;
use futures_util::stream::{self, StreamExt};
use futures_util::SinkExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Engine with behavior picked by the turn input:
/// - `"fail"` streams one fragment then errors
/// - `"refuse"` fails before streaming
/// - `"hang"` streams one fragment then never finishes
/// - anything else streams its words back
#[derive(Default)]
pub struct ScriptedEngine {
    pub turns: Mutex<Vec<TurnRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    pub released: Mutex<Vec<String>>,
}

#[async_trait]
impl CompletionEngine for ScriptedEngine {
    async fn initialize(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn start_turn(&self, turn: TurnRequest) -> Result<FragmentStream, EngineError> {
        let input = turn.input.clone();
        self.turns.lock().unwrap().push(turn);
        match input.as_str() {
            "refuse" => Err(EngineError::Unavailable("no capacity".to_string())),
            "fail" => Ok(stream::iter(vec![
                Ok("partial ".to_string()),
                Err(EngineError::Stream("model crashed".to_string())),
            ])
            .boxed()),
            "hang" => Ok(stream::iter(vec![Ok::<_, EngineError>("thinking".to_string())])
                .chain(stream::pending())
                .boxed()),
            _ => {
                let words: Vec<Result<String, EngineError>> = input
                    .split_inclusive(' ')
                    .map(|w| Ok(w.to_string()))
                    .collect();
                Ok(stream::iter(words).boxed())
            }
        }
    }

    async fn cancel_turn(&self, session_id: &str) {
        self.cancelled.lock().unwrap().push(session_id.to_string());
    }

    async fn release_session(&self, session_id: &str) {
        self.released.lock().unwrap().push(session_id.to_string());
    }

    async fn shutdown(&self) {}
}

pub struct TestServer {
    pub state: AppState,
    pub engine: Arc<ScriptedEngine>,
}

impl TestServer {
    pub fn new() -> Self {
        let engine = Arc::new(ScriptedEngine::default());
        let state = AppState::new(engine.clone());
        Self { state, engine }
    }

    /// Returns an Axum Router wired to this server's state for `oneshot()` calls.
    pub fn router(&self) -> axum::Router {
        routes::router(self.state.clone())
    }

    /// Binds a TCP listener on port 0, spawns the server, and returns the
    /// `ws://` base URL.
    pub async fn spawn(&self) -> String {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://127.0.0.1:{}", addr.port())
    }
}

/// Open `/ws` and consume the confirmation. Returns the socket and session id.
pub async fn connect(base: &str, query: &str) -> (Ws, String) {
    let (mut ws, _) = connect_async(format!("{base}/ws{query}")).await.unwrap();
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "session:idle", "first frame must confirm the session");
    let session_id = first["sessionId"].as_str().unwrap().to_string();
    (ws, session_id)
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    send_raw(ws, &value.to_string()).await;
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, failing the test after five seconds.
pub async fn next_json(ws: &mut Ws) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read frames until a terminal one; returns (concatenated deltas, terminal).
pub async fn collect_turn(ws: &mut Ws) -> (String, serde_json::Value) {
    let mut text = String::new();
    loop {
        let frame = next_json(ws).await;
        match frame["type"].as_str().unwrap() {
            "message:delta" => text.push_str(frame["chunk"].as_str().unwrap()),
            _ => return (text, frame),
        }
    }
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
