//! # huddle-chat
//!
//! Minimal terminal client for a Huddle relay.
//!
//! ## Usage
//!
//! ```bash
//! # Join "general" as u-1 on a local relay
//! HUDDLE_USER=u-1 HUDDLE_EMAIL=dee@example.com huddle-chat general
//!
//! # Custom relay and sync settings
//! HUDDLE_URL=ws://10.0.0.5:8080/ws HUDDLE_SYNC_CONFIG=sync.toml huddle-chat general
//! ```
//!
//! Type a line to send it. `/view` prints the current view as JSON,
//! `/quit` leaves.

use anyhow::{Context, Result};
use huddle_client::{ChatClient, ChatView, CurrentUser, SessionContext, SyncConfig, SyncController};
use huddle_core::ConnectionState;
use huddle_transport::{WebSocketBackend, WebSocketConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_client=info,huddle_transport=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    huddle_client::metrics::describe_metrics();

    let channel_id = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HUDDLE_CHANNEL").ok())
        .context("Usage: huddle-chat <channel>")?;

    let config = match std::env::var("HUDDLE_SYNC_CONFIG") {
        Ok(path) => {
            let path = shellexpand::tilde(&path).into_owned();
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read sync config: {path}"))?;
            SyncConfig::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse sync config: {path}"))?
        }
        Err(_) => SyncConfig::default(),
    };

    let session = SessionContext::new();
    if let Ok(id) = std::env::var("HUDDLE_USER") {
        let mut user = CurrentUser::new(id);
        if let Ok(email) = std::env::var("HUDDLE_EMAIL") {
            user = user.with_email(email);
        }
        session.sign_in(user);
    }

    let ws_config = WebSocketConfig {
        url: std::env::var("HUDDLE_URL").unwrap_or_else(|_| WebSocketConfig::default().url),
        ..Default::default()
    };
    let backend = Arc::new(
        WebSocketBackend::connect(ws_config)
            .await
            .context("Failed to connect to relay")?,
    );

    let controller = SyncController::new(backend.clone(), backend, config);
    let client = ChatClient::spawn(controller, Arc::new(session));
    let mut view = client.subscribe_view();

    if let Err(e) = client.start(channel_id.as_str()).await {
        eprintln!("! {e} (set HUDDLE_USER to sign in)");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = Printer::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else { break };
                match line.trim() {
                    "/quit" => break,
                    "/view" => println!("{}", serde_json::to_string_pretty(&client.view())?),
                    _ => client.send(line.as_str()).await?,
                }
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                printer.print(&view.borrow_and_update());
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}

/// Prints what changed between views.
#[derive(Default)]
struct Printer {
    shown: HashSet<String>,
    connection: ConnectionState,
    error: Option<String>,
}

impl Printer {
    fn print(&mut self, view: &ChatView) {
        if view.connection_state != self.connection {
            self.connection = view.connection_state;
            eprintln!("* {}", self.connection);
        }
        if view.error != self.error {
            self.error = view.error.clone();
            if let Some(error) = &self.error {
                eprintln!("! {error}");
            }
        }
        for message in view.messages.iter().filter(|m| !m.optimistic) {
            if self.shown.insert(message.id.clone()) {
                println!("<{}> {}", message.sender_name, message.content);
            }
        }
    }
}
