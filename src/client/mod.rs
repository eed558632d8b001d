//! Client side of the session protocol: one logical connection with
//! confirmed connect, keep-alive and bounded reconnection.
//!
//! [`ChatClient`] is a handle to a background task that owns the socket and
//! every timer. Callers send commands and observe state changes and frames
//! through [`ClientEvent`]s; nothing here returns an error to the caller.

pub mod machine;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::future::pending;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::gateway::frames::{close_code, ClientFrame, ServerFrame};
pub use machine::{AfterLoss, Backoff, ConnectionAttempt, ConnectionState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingConnect = BoxFuture<'static, Result<WsStream, tungstenite::Error>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Frame(ServerFrame),
    /// Reconnect attempts are exhausted. Only an explicit connect starts over.
    GaveUp,
    /// A cancel was not acknowledged in time; treat the turn as over.
    CancelTimedOut,
    /// A turn was requested while no confirmed session existed.
    NotConnected,
}

#[derive(Debug)]
enum Command {
    Connect(Option<String>),
    Switch(String),
    StartTurn(String),
    CancelTurn,
    Disconnect,
}

pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ChatClient {
    /// Start the connection task. The client begins `Disconnected`.
    pub fn spawn(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            machine: ConnectionAttempt::new(Backoff::from_config(&config)),
            config,
            conversation_id: None,
            socket: None,
            connecting: None,
            reconnect_timer: None,
            keepalive: None,
            pong_deadline: None,
            cancel_deadline: None,
            published: ConnectionState::Disconnected,
            state_tx,
            events,
        };
        tokio::spawn(driver.run(command_rx));

        (Self { commands, state }, event_rx)
    }

    pub fn connect(&self, conversation_id: Option<&str>) {
        let _ = self
            .commands
            .send(Command::Connect(conversation_id.map(str::to_string)));
    }

    /// Close the current socket, wait for it to finish closing, then open a
    /// session bound to `conversation_id`.
    pub fn switch_conversation(&self, conversation_id: &str) {
        let _ = self
            .commands
            .send(Command::Switch(conversation_id.to_string()));
    }

    pub fn start_turn(&self, input: &str) {
        let _ = self.commands.send(Command::StartTurn(input.to_string()));
    }

    pub fn cancel_turn(&self) {
        let _ = self.commands.send(Command::CancelTurn);
    }

    /// Close the socket and stop all automatic reconnection.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

struct Driver {
    config: ClientConfig,
    machine: ConnectionAttempt,
    conversation_id: Option<String>,
    socket: Option<WsStream>,
    connecting: Option<PendingConnect>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    keepalive: Option<Interval>,
    pong_deadline: Option<Pin<Box<Sleep>>>,
    cancel_deadline: Option<Pin<Box<Sleep>>>,
    published: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

async fn wait_connect(connecting: &mut Option<PendingConnect>) -> Result<WsStream, tungstenite::Error> {
    match connecting {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_message(socket: &mut Option<WsStream>) -> Option<Result<Message, tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        // Handle dropped
                        self.close_socket().await;
                        return;
                    }
                },
                opened = wait_connect(&mut self.connecting) => {
                    self.connecting = None;
                    match opened {
                        Ok(ws) => self.socket = Some(ws),
                        Err(e) => {
                            tracing::debug!("connect failed: {e}");
                            self.on_lost();
                        }
                    }
                }
                msg = next_message(&mut self.socket) => self.on_message(msg),
                () = fire(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    if self.machine.retry_elapsed() {
                        self.open_socket();
                    }
                    self.sync();
                }
                () = tick(&mut self.keepalive) => self.send_ping().await,
                () = fire(&mut self.pong_deadline) => {
                    tracing::warn!("no pong within {:?}, dropping connection", self.config.pong_timeout);
                    self.pong_deadline = None;
                    self.socket = None;
                    self.on_lost();
                }
                () = fire(&mut self.cancel_deadline) => {
                    self.cancel_deadline = None;
                    self.emit(ClientEvent::CancelTimedOut);
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(conversation_id) => {
                if self.machine.state() == ConnectionState::Disconnected {
                    if conversation_id.is_some() {
                        self.conversation_id = conversation_id;
                    }
                    self.machine.connect_requested();
                    self.open_socket();
                    self.sync();
                } else if let Some(conversation_id) = conversation_id {
                    self.switch(conversation_id).await;
                }
            }
            Command::Switch(conversation_id) => self.switch(conversation_id).await,
            Command::StartTurn(input) => {
                if self.machine.state() != ConnectionState::Connected {
                    self.emit(ClientEvent::NotConnected);
                    return;
                }
                let frame = ClientFrame::StartTurn {
                    conversation_id: self.conversation_id.clone(),
                    input,
                };
                self.send_frame(&frame).await;
            }
            Command::CancelTurn => {
                if self.machine.state() != ConnectionState::Connected {
                    return;
                }
                if self.send_frame(&ClientFrame::Cancel {}).await {
                    self.cancel_deadline =
                        Some(Box::pin(tokio::time::sleep(self.config.cancel_timeout)));
                }
            }
            Command::Disconnect => {
                self.close_socket().await;
                self.machine.disconnect();
                self.sync();
            }
        }
    }

    async fn switch(&mut self, conversation_id: String) {
        if self.conversation_id.as_deref() == Some(conversation_id.as_str())
            && self.machine.state() != ConnectionState::Disconnected
        {
            return;
        }
        // The old socket must be fully closed before the new one opens.
        self.close_socket().await;
        self.machine.disconnect();
        self.conversation_id = Some(conversation_id);
        self.machine.connect_requested();
        self.open_socket();
        self.sync();
    }

    fn on_message(&mut self, msg: Option<Result<Message, tungstenite::Error>>) {
        match msg {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<ServerFrame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!("ignoring unreadable frame: {e}");
                        return;
                    }
                };
                match &frame {
                    ServerFrame::SessionIdle { session_id } => {
                        if self.machine.confirmed() {
                            tracing::info!("session {session_id} confirmed");
                            self.start_keepalive();
                            self.sync();
                        }
                    }
                    ServerFrame::Pong {} => {
                        self.machine.pong_received();
                        self.pong_deadline = None;
                    }
                    _ => {}
                }
                if frame.is_terminal() {
                    self.cancel_deadline = None;
                }
                self.emit(ClientEvent::Frame(frame));
            }
            Some(Ok(Message::Close(_))) | None => {
                self.socket = None;
                self.on_lost();
            }
            Some(Err(e)) => {
                tracing::debug!("socket error: {e}");
                self.socket = None;
                self.on_lost();
            }
            _ => {}
        }
    }

    fn on_lost(&mut self) {
        self.socket = None;
        self.connecting = None;
        match self.machine.socket_lost() {
            AfterLoss::Retry { attempt, delay } => {
                tracing::info!("connection lost, reconnect attempt {attempt} in {:?}", delay);
                self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
            }
            AfterLoss::GiveUp => {
                tracing::warn!(
                    "giving up after {} reconnect attempt(s)",
                    self.config.max_reconnect_attempts
                );
                self.emit(ClientEvent::GaveUp);
            }
            AfterLoss::Ignored => {}
        }
        self.sync();
    }

    fn socket_url(&self) -> String {
        let raw = format!("{}/ws", self.config.server_url);
        match reqwest::Url::parse(&raw) {
            Ok(mut url) => {
                if let Some(ref conversation_id) = self.conversation_id {
                    url.query_pairs_mut()
                        .append_pair("conversationId", conversation_id);
                }
                url.to_string()
            }
            Err(_) => raw,
        }
    }

    fn open_socket(&mut self) {
        let url = self.socket_url();
        tracing::debug!("opening {url}");
        self.socket = None;
        self.connecting = Some(
            async move {
                tokio_tungstenite::connect_async(url)
                    .await
                    .map(|(ws, _)| ws)
            }
            .boxed(),
        );
    }

    /// Close the socket and wait for the close handshake, bounded by
    /// `close_timeout`.
    async fn close_socket(&mut self) {
        self.connecting = None;
        let Some(mut ws) = self.socket.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::from(close_code::NORMAL),
            reason: "client closing".into(),
        };
        let _ = ws.close(Some(frame)).await;
        let drained = tokio::time::timeout(self.config.close_timeout, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
        if drained.is_err() {
            tracing::debug!("close handshake timed out");
        }
    }

    async fn send_frame(&mut self, frame: &ClientFrame) -> bool {
        let Some(ws) = self.socket.as_mut() else {
            return false;
        };
        let text = serde_json::to_string(frame).unwrap_or_default();
        if let Err(e) = ws.send(Message::Text(text.into())).await {
            tracing::debug!("send failed: {e}");
            self.socket = None;
            self.on_lost();
            return false;
        }
        true
    }

    fn start_keepalive(&mut self) {
        let period = self.config.keepalive_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.keepalive = Some(interval);
        self.pong_deadline = None;
    }

    async fn send_ping(&mut self) {
        if !self.send_frame(&ClientFrame::Ping {}).await {
            return;
        }
        self.machine.ping_sent(Instant::now());
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(Box::pin(tokio::time::sleep(self.config.pong_timeout)));
        }
    }

    /// Publish the machine's state and drop every timer armed by a state
    /// that has been left.
    fn sync(&mut self) {
        let state = self.machine.state();
        if state != ConnectionState::Connected {
            self.keepalive = None;
            self.pong_deadline = None;
            self.cancel_deadline = None;
        }
        if !matches!(state, ConnectionState::Reconnecting(_)) {
            self.reconnect_timer = None;
        }
        if state != ConnectionState::Connecting {
            self.connecting = None;
        }
        if state != self.published {
            self.published = state;
            self.state_tx.send_replace(state);
            self.emit(ClientEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}
