//! chat-probe: open one live chat connection and watch it.
//!
//! Reads `CHAT_API_URL` from the environment. Every stdin line is sent as a
//! text message; `/typing`, `/read`, `/search <query>` and `/quit` are
//! commands. Set `RUST_LOG=debug` for connection traces.
//!
//! Build with `--features cli`.

use clap::Parser;
use stylo_chat::{ChatConfig, ChatNotice, ChatSession, ConnectionState};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "chat-probe")]
#[command(version)]
#[command(about = "Open a chat connection and log everything it carries", long_about = None)]
struct Cli {
    /// User to connect as.
    #[arg(long, value_name = "ID")]
    user: String,

    /// Conversation to open.
    #[arg(long, value_name = "ID")]
    conversation: String,

    /// Base API URL; overrides CHAT_API_URL.
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = ChatConfig::from_env();
    if let Some(url) = cli.api_url {
        config = config.with_base_url(url);
    }

    let mut session = ChatSession::with_websocket(config, cli.user.clone());
    let mut notices = session
        .take_notice_rx()
        .ok_or("notice receiver already taken")?;
    let conversation = cli.conversation;
    session.open(&conversation)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seen_version = 0;

    loop {
        tokio::select! {
            _ = session.step() => {}
            Some(notice) = notices.recv() => {
                log::info!("{notice:?}");
                if matches!(notice, ChatNotice::ConnectionClosed { .. }) {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                let result = match line.split_once(' ').unwrap_or((line, "")) {
                    ("", _) => continue,
                    ("/quit", _) => break,
                    ("/typing", _) => session.send_typing(&conversation, true),
                    ("/read", _) => session
                        .mark_conversation_read(&conversation)
                        .map(|n| log::info!("Marked {n} message(s) read")),
                    ("/search", query) => session
                        .search(query)
                        .map(|id| log::info!("Search {id} sent")),
                    _ => session.send_text(&conversation, line).map(|_| ()),
                };
                if let Err(e) = result {
                    log::error!("{e}");
                }
            }
        }

        let snapshot = session.snapshot();
        if snapshot.store.version() != seen_version {
            seen_version = snapshot.store.version();
            if let Some(message) = snapshot.store.messages(&conversation).last() {
                println!(
                    "[{}] {}: {}",
                    message.message_type.envelope_type(),
                    message.sender_id,
                    message.content.as_deref().unwrap_or("<attachment>")
                );
            }
        }
        if snapshot.connection_state(&conversation) == Some(ConnectionState::Closed) {
            break;
        }
    }

    session.shutdown();
    Ok(())
}
