//! Parley command-line client.
//!
//! # Usage
//!
//! ```bash
//! # Join c1 and send each stdin line as a message
//! parley --server ws://localhost:3000/ws --token abc --user u1 --conversation c1
//!
//! # Settings from a file, token on the command line
//! parley --config parley.toml --token abc --conversation c1
//! ```
//!
//! Input lines starting with `/` are commands: `/quit`, `/bg`, `/fg` and
//! `/retry <temp-id>`.

use std::{
    collections::HashMap,
    io::{self, Write},
    path::PathBuf,
};

use clap::Parser;
use parley_client::{ClientConfig, SyncClient, SystemEnv};
use parley_proto::{MessageKind, MessageStatus};
use parley_sync::{MemoryStore, MessageStore, RedbStore, SyncUpdate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parley chat sync client
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(about = "Parley real-time chat sync client")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket endpoint, overrides the configuration
    #[arg(short, long)]
    server: Option<String>,

    /// Session token
    #[arg(short, long)]
    token: String,

    /// Signed-in user id, overrides the configuration
    #[arg(short, long)]
    user: Option<String>,

    /// Conversation to join
    #[arg(long)]
    conversation: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = &args.server {
        config.server_url.clone_from(server);
    }
    if let Some(user) = &args.user {
        config.user_id.clone_from(user);
    }
    if let Some(level) = &args.log_level {
        config.log_level.clone_from(level);
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    tracing::info!(server = %config.server_url, user = %config.user_id, "Parley client starting");

    match config.store_path.clone() {
        Some(path) => {
            let store = RedbStore::open_with_capacity(&path, config.cache_capacity)?;
            tracing::info!(%path, "using redb cache");
            run(store, &config, &args).await
        },
        None => {
            tracing::info!("using in-memory cache");
            run(MemoryStore::new(), &config, &args).await
        },
    }
}

async fn run<S: MessageStore>(
    store: S,
    config: &ClientConfig,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let (client, runtime) =
        SyncClient::spawn(SystemEnv::new(), store, config.user_id.clone(), config.engine_config());

    tokio::spawn(print_messages(client.clone()));
    tokio::spawn(print_updates(client.clone()));

    client.connect(args.token.clone()).await?;
    client.join_conversation(args.conversation.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {},
            ("/quit", _) => break,
            ("/bg", _) => client.enter_background()?,
            ("/fg", _) => client.ensure_connected()?,
            ("/retry", temp_id) => {
                if let Err(error) = client.retry_message(args.conversation.clone(), temp_id.trim()).await {
                    tracing::warn!(%error, "retry failed");
                }
            },
            _ => {
                let temp_id = client
                    .send_message(args.conversation.clone(), line, MessageKind::Text, None, None)
                    .await?;
                tracing::debug!(%temp_id, "queued message");
            },
        }
    }

    client.leave_conversation(args.conversation.clone())?;
    client.disconnect()?;
    client.shutdown()?;
    runtime.await?;
    Ok(())
}

/// Print messages of the active conversation as they appear or change state.
async fn print_messages(client: SyncClient<SystemEnv>) {
    let mut messages = client.messages();
    let mut shown: HashMap<String, MessageStatus> = HashMap::new();

    while messages.changed().await.is_ok() {
        let snapshot = messages.borrow_and_update().clone();
        let mut out = io::stdout().lock();
        for message in &snapshot.messages {
            if shown.get(&message.id) == Some(&message.status) {
                continue;
            }
            shown.insert(message.id.clone(), message.status);
            let text = message.translated_content.as_deref().unwrap_or(&message.original_content);
            let _ = writeln!(out, "[{:?}] {}: {text}", message.status, message.sender_id);
        }
    }
}

/// Print connectivity changes, send failures and server errors.
async fn print_updates(client: SyncClient<SystemEnv>) {
    let mut updates = client.updates();
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "update stream lagged");
                continue;
            },
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        };

        let line = match update {
            SyncUpdate::Connectivity(connectivity) => format!("* {connectivity:?}"),
            SyncUpdate::SendFailed { temp_id, .. } => format!("* send failed: {temp_id} (/retry {temp_id})"),
            SyncUpdate::ServerError { code, message } => format!("* server error {code}: {message}"),
            SyncUpdate::Conversations | SyncUpdate::Messages { .. } | SyncUpdate::Typing { .. } => continue,
        };
        let _ = writeln!(io::stdout().lock(), "{line}");
    }
}
