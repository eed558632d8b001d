mod common;

use chatlink::client::{ChatClient, ClientEvent, ConnectionState};
use chatlink::config::ClientConfig;
use chatlink::gateway::frames::ServerFrame;
use common::{eventually, TestServer};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

fn fast_config(url: &str) -> ClientConfig {
    ClientConfig {
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(100),
        ..ClientConfig::new(url)
    }
}

async fn next_event(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("client task ended")
}

/// Skip events until `state` is reported.
async fn wait_for_state(events: &mut UnboundedReceiver<ClientEvent>, state: ConnectionState) {
    loop {
        if next_event(events).await == ClientEvent::StateChanged(state) {
            return;
        }
    }
}

/// Skip events until a frame arrives.
async fn next_frame(events: &mut UnboundedReceiver<ClientEvent>) -> ServerFrame {
    loop {
        if let ClientEvent::Frame(frame) = next_event(events).await {
            return frame;
        }
    }
}

fn idle_frame(session_id: &str) -> Message {
    let frame = ServerFrame::SessionIdle {
        session_id: session_id.to_string(),
    };
    Message::Text(frame.to_json().into())
}

/// Next text frame read by a hand-driven server, as JSON.
async fn next_text<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>) -> serde_json::Value
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the socket")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Accept one client, confirm it as `session_id`, then forward every text
/// frame it sends. The close handshake is answered while reading.
async fn confirming_server(
    listener: TcpListener,
    session_id: &'static str,
) -> UnboundedReceiver<serde_json::Value> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(idle_frame(session_id)).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let _ = tx.send(serde_json::from_str(text.as_str()).unwrap());
            }
        }
    });
    rx
}

/// An address nothing listens on.
async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("ws://127.0.0.1:{port}")
}

#[tokio::test]
async fn test_client_connects_after_confirmation() {
    let server = TestServer::new();
    let url = server.spawn().await;
    let (client, mut events) = ChatClient::spawn(fast_config(&url));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect(Some("C1"));
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::StateChanged(ConnectionState::Connected)
    );
    match next_frame(&mut events).await {
        ServerFrame::SessionIdle { session_id } => {
            assert_eq!(
                server.state.sessions.conversation_of(&session_id).as_deref(),
                Some("C1")
            );
        }
        other => panic!("expected session:idle, got {other:?}"),
    }
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_open_socket_alone_is_not_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (client, mut events) = ChatClient::spawn(fast_config(&url));
    client.connect(None);

    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    // Anything other than the confirmation leaves the client connecting
    ws.send(Message::Text(ServerFrame::Pong {}.to_json().into()))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(next_frame(&mut events).await, ServerFrame::Pong {});
    assert_eq!(client.state(), ConnectionState::Connecting);

    ws.send(idle_frame("S1")).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_client_reconnects_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let config = ClientConfig {
        keepalive_interval: Duration::from_millis(50),
        ..fast_config(&url)
    };
    let (client, mut events) = ChatClient::spawn(config);
    client.connect(None);

    let (tcp, _) = listener.accept().await.unwrap();
    let mut first = tokio_tungstenite::accept_async(tcp).await.unwrap();
    first.send(idle_frame("S1")).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;

    drop(first);
    wait_for_state(&mut events, ConnectionState::Reconnecting(1)).await;

    let (tcp, _) = listener.accept().await.unwrap();
    let mut second = tokio_tungstenite::accept_async(tcp).await.unwrap();
    second.send(idle_frame("S2")).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;
    match next_frame(&mut events).await {
        ServerFrame::SessionIdle { session_id } => assert_eq!(session_id, "S2"),
        other => panic!("expected session:idle, got {other:?}"),
    }

    // Keep-alive resumes on the new socket
    let ping = next_text(&mut second).await;
    assert_eq!(ping["type"], "ping");

    // The attempt counter starts over: the next loss is attempt 1 again
    drop(second);
    wait_for_state(&mut events, ConnectionState::Reconnecting(1)).await;
}

#[tokio::test]
async fn test_client_gives_up_after_max_attempts() {
    let url = dead_address().await;
    let (client, mut events) = ChatClient::spawn(fast_config(&url));
    client.connect(None);

    let mut states = Vec::new();
    loop {
        match next_event(&mut events).await {
            ClientEvent::StateChanged(state) => states.push(state),
            ClientEvent::GaveUp => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    let expected_prefix = [
        ConnectionState::Connecting,
        ConnectionState::Reconnecting(1),
        ConnectionState::Connecting,
        ConnectionState::Reconnecting(2),
        ConnectionState::Connecting,
        ConnectionState::Reconnecting(3),
        ConnectionState::Connecting,
        ConnectionState::Reconnecting(4),
        ConnectionState::Connecting,
        ConnectionState::Reconnecting(5),
        ConnectionState::Connecting,
    ];
    assert_eq!(states, expected_prefix);
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::StateChanged(ConnectionState::Disconnected)
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // No further retries without an explicit connect
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_cancels_pending_retry() {
    let url = dead_address().await;
    let config = ClientConfig {
        reconnect_base_delay: Duration::from_secs(60),
        ..ClientConfig::new(&url)
    };
    let (client, mut events) = ChatClient::spawn(config);
    client.connect(None);
    wait_for_state(&mut events, ConnectionState::Reconnecting(1)).await;

    client.disconnect();
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::StateChanged(ConnectionState::Disconnected)
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_pong_drops_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let config = ClientConfig {
        keepalive_interval: Duration::from_millis(50),
        pong_timeout: Duration::from_millis(100),
        ..fast_config(&url)
    };
    let (client, mut events) = ChatClient::spawn(config);
    client.connect(None);

    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
    ws.send(idle_frame("S1")).await.unwrap();
    wait_for_state(&mut events, ConnectionState::Connected).await;

    // The client pings but this server never answers
    let ping = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ping: serde_json::Value = serde_json::from_str(ping.to_text().unwrap()).unwrap();
    assert_eq!(ping["type"], "ping");

    wait_for_state(&mut events, ConnectionState::Reconnecting(1)).await;
}

#[tokio::test]
async fn test_turn_before_connect_is_refused() {
    let (client, mut events) = ChatClient::spawn(ClientConfig::new("ws://127.0.0.1:1"));
    client.start_turn("hello");
    assert_eq!(next_event(&mut events).await, ClientEvent::NotConnected);
}

#[tokio::test]
async fn test_turn_through_client() {
    let server = TestServer::new();
    let url = server.spawn().await;
    let (client, mut events) = ChatClient::spawn(fast_config(&url));
    client.connect(Some("C1"));
    wait_for_state(&mut events, ConnectionState::Connected).await;

    client.start_turn("hi there");
    let mut text = String::new();
    loop {
        match next_frame(&mut events).await {
            ServerFrame::MessageDelta { chunk } => text.push_str(&chunk),
            ServerFrame::MessageDone {} => break,
            ServerFrame::SessionIdle { .. } => {}
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(text, "hi there");
    assert_eq!(server.engine.turns.lock().unwrap()[0].conversation_id, "C1");
}

#[tokio::test]
async fn test_switch_conversation_replaces_session() {
    let server = TestServer::new();
    let url = server.spawn().await;
    let (client, mut events) = ChatClient::spawn(fast_config(&url));
    client.connect(Some("C1"));
    wait_for_state(&mut events, ConnectionState::Connected).await;
    let first = match next_frame(&mut events).await {
        ServerFrame::SessionIdle { session_id } => session_id,
        other => panic!("expected session:idle, got {other:?}"),
    };

    client.switch_conversation("C2");
    wait_for_state(&mut events, ConnectionState::Connecting).await;
    wait_for_state(&mut events, ConnectionState::Connected).await;
    let second = match next_frame(&mut events).await {
        ServerFrame::SessionIdle { session_id } => session_id,
        other => panic!("expected session:idle, got {other:?}"),
    };

    assert_ne!(first, second);
    assert_eq!(
        server.state.sessions.conversation_of(&second).as_deref(),
        Some("C2")
    );
    let sessions = server.state.sessions.clone();
    eventually(move || !sessions.contains(&first) && sessions.len() == 1).await;
}

#[tokio::test]
async fn test_unacknowledged_cancel_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let mut inbound = confirming_server(listener, "S1").await;
    let config = ClientConfig {
        cancel_timeout: Duration::from_millis(100),
        ..fast_config(&url)
    };
    let (client, mut events) = ChatClient::spawn(config);
    client.connect(None);
    wait_for_state(&mut events, ConnectionState::Connected).await;

    client.cancel_turn();
    let frame = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["type"], "cancel");
    loop {
        if next_event(&mut events).await == ClientEvent::CancelTimedOut {
            break;
        }
    }
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_cancel_timer_ends_with_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let mut inbound = confirming_server(listener, "S1").await;
    let config = ClientConfig {
        cancel_timeout: Duration::from_millis(150),
        ..fast_config(&url)
    };
    let (client, mut events) = ChatClient::spawn(config);
    client.connect(None);
    wait_for_state(&mut events, ConnectionState::Connected).await;

    client.cancel_turn();
    let frame = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["type"], "cancel");

    client.disconnect();
    loop {
        match next_event(&mut events).await {
            ClientEvent::StateChanged(ConnectionState::Disconnected) => break,
            ClientEvent::CancelTimedOut => panic!("cancel timer outlived the connection"),
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(event) = events.try_recv() {
        assert_ne!(event, ClientEvent::CancelTimedOut, "cancel timer outlived the connection");
    }
}

#[tokio::test]
async fn test_cancel_while_disconnected_arms_nothing() {
    let config = ClientConfig {
        cancel_timeout: Duration::from_millis(50),
        ..ClientConfig::new("ws://127.0.0.1:1")
    };
    let (client, mut events) = ChatClient::spawn(config);
    client.cancel_turn();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
}
