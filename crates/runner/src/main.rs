//! Gangchat Runner - composition root binary
//!
//! Wires the websocket transport, the HTTP history client and the file-backed
//! credential store into a [`ChatConnectionManager`], then drives it from
//! stdin:
//!
//! ```text
//! game <text>   send {"text": <text>} on the game channel
//! gang <text>   send {"text": <text>} on the gang channel
//! quit          disconnect and exit
//! ```

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gangchat_client::infrastructure::http_client::HttpChatApi;
use gangchat_client::infrastructure::storage::{CredentialStore, FileKeyValueStore};
use gangchat_client::infrastructure::websocket::WsTransport;
use gangchat_client::ports::outbound::{ChatAction, ChatStore, HeaderPair};
use gangchat_client::{ChannelId, ChatConfig, ChatConnectionManager, ChatDependencies};

/// Prints store actions instead of keeping them.
struct ConsoleStore {
    displayed_path: Option<String>,
}

impl ChatStore for ConsoleStore {
    fn dispatch(&self, action: ChatAction) {
        match action {
            ChatAction::ReplaceMessages { channel, messages } => {
                println!("[{channel}] {} messages", messages.len());
                if let Some(last) = messages.last() {
                    println!("[{channel}] latest: {last}");
                }
            }
            ChatAction::ConnectionChanged { channel, state } => {
                println!("[{channel}] {state:?}");
            }
            ChatAction::SetMessagesRead { channel, read: false } => {
                println!("[{channel}] new unread message");
            }
            ChatAction::SetMessagesRead { .. } | ChatAction::SetLoading { .. } => {}
        }
    }

    fn displayed_path(&self) -> Option<String> {
        self.displayed_path.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Prefer local overrides.
    for filename in [".env.local", ".env"] {
        let _ = dotenvy::from_filename(filename);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gangchat_client=debug,gangchat_runner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Gangchat runner");

    let config = ChatConfig::from_env()?;
    let game_path = std::env::var("CHAT_GAME_PATH").ok();
    let gang_path = std::env::var("CHAT_GANG_PATH").ok();

    let storage = FileKeyValueStore::open_default().await;
    tracing::info!("Using credential storage at {:?}", storage.path());
    let credentials = CredentialStore::new(Arc::new(storage));
    if let Ok(token) = std::env::var("CHAT_AUTH_TOKEN") {
        credentials
            .save_headers(&[HeaderPair::new("Authorization", format!("Bearer {token}"))])
            .await?;
    }

    let deps = ChatDependencies {
        transport: Arc::new(WsTransport::new(config.connect_timeout)),
        api: Arc::new(HttpChatApi::new(&config.api_base_url, credentials.clone())?),
        store: Arc::new(ConsoleStore {
            displayed_path: game_path.clone(),
        }),
        credentials,
    };

    tracing::info!("Chat API at {}", config.api_base_url);
    let manager = ChatConnectionManager::spawn(config, deps);
    manager.connect(ChannelId::Game, game_path.as_deref());
    manager.connect(ChannelId::Gang, gang_path.as_deref());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let (target, text) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
        let path = match target {
            "quit" => break,
            "game" => game_path.as_deref(),
            "gang" => gang_path.as_deref(),
            "" => continue,
            other => {
                println!("unknown command: {other} (use game, gang or quit)");
                continue;
            }
        };

        let Some(path) = path else {
            println!("{target} channel has no path configured");
            continue;
        };
        if !manager.send_message(path, &json!({ "text": text })).await {
            println!("not sent: {target} channel is not connected");
        }
    }

    manager.disconnect();
    if let Some(snapshot) = manager.snapshot(ChannelId::Game).await {
        tracing::debug!("Final game channel state: {:?}", snapshot.state);
    }
    tracing::info!("Gangchat runner stopped");
    Ok(())
}
