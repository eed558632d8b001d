use clap::Parser;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use chatlink::client::{ChatClient, ClientEvent, ConnectionState};
use chatlink::config::ClientConfig;
use chatlink::gateway::frames::ServerFrame;

/// Terminal chat client. Each input line starts a turn; `/cancel`,
/// `/switch <conversation>` and `/quit` control the session.
#[derive(Parser, Debug)]
#[command(name = "chatlink-chat")]
struct Cli {
    /// Server base URL
    #[arg(long, default_value = "ws://127.0.0.1:39100")]
    url: String,

    /// Conversation to bind on connect
    #[arg(long)]
    conversation: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatlink=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (client, mut events) = ChatClient::spawn(ClientConfig::from_env(&cli.url));
    client.connect(Some(&cli.conversation));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();
                match line.split_once(' ').unwrap_or((line, "")) {
                    ("/quit", _) => break,
                    ("/cancel", _) => client.cancel_turn(),
                    ("/switch", conversation) if !conversation.is_empty() => {
                        client.switch_conversation(conversation.trim());
                    }
                    ("", _) => {}
                    _ => client.start_turn(line),
                }
            }
            Some(event) = events.recv() => match event {
                ClientEvent::StateChanged(ConnectionState::Reconnecting(n)) => {
                    eprintln!("[reconnecting, attempt {n}]");
                }
                ClientEvent::StateChanged(state) => eprintln!("[{state:?}]"),
                ClientEvent::Frame(ServerFrame::MessageDelta { chunk }) => {
                    print!("{chunk}");
                    let _ = std::io::stdout().flush();
                }
                ClientEvent::Frame(ServerFrame::MessageDone {}) => println!(),
                ClientEvent::Frame(ServerFrame::MessageCancelled {}) => println!(" [cancelled]"),
                ClientEvent::Frame(ServerFrame::Error { code, message }) => {
                    eprintln!("[error {code}: {message}]");
                }
                ClientEvent::Frame(_) => {}
                ClientEvent::GaveUp => {
                    eprintln!("[server unreachable, giving up]");
                    break;
                }
                ClientEvent::CancelTimedOut => eprintln!("[cancel not acknowledged]"),
                ClientEvent::NotConnected => eprintln!("[not connected yet]"),
            },
        }
    }

    client.disconnect();
}
