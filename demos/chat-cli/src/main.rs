//! Line-oriented chat client.
//!
//! Run with: cargo run -p chat-cli
//!
//! Every line typed is sent to the `global` conversation. Commands:
//! `/login <user> <password>`, `/register <user> <password>`, `/logout`,
//! `/quit`. Logs go to stderr; set `RUST_LOG` to change the level.

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use chat_sync_api::ApiClient;
use chat_sync_channel::{Connector, WsConnector};
use chat_sync_core::{
    CredentialStore, Direction, Message, MessageId, Session, config::load_config,
};
use chat_sync_engine::{Notice, SyncEngine, SyncError, restore_session, storage::FileStore};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SCOPE: &str = "global";

type Input = Lines<BufReader<Stdin>>;

enum Exit {
    Quit,
    Logout,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config().context("Failed to load configuration")?;
    tracing::info!(data_dir = %config.data_dir.display(), server = %config.server_url, "Starting");

    let store = Arc::new(FileStore::new(&config.data_dir));
    let api = ApiClient::new(&config.api_url)?;
    let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(config.server_url.clone()));
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let session = match restore_session(store.as_ref()).await {
            Ok(session) => session,
            Err(SyncError::AuthRequired) => match login(&api, store.as_ref(), &mut input).await? {
                Some(session) => session,
                None => return Ok(()),
            },
            Err(e) => return Err(e).context("Failed to read the stored session"),
        };

        println!("Signed in as {}. Type a message, /logout or /quit.", session.username());
        let engine = SyncEngine::initialize(
            SCOPE,
            session,
            store.clone(),
            Arc::clone(&connector),
            &config,
        )
        .await;
        println!("Joined #{}.", engine.scope());

        let exit = chat(&engine, &mut input).await;
        if let Err(e) = engine.teardown().await {
            eprintln!("! Could not save the latest messages: {e}");
        }

        match exit? {
            Exit::Quit => return Ok(()),
            Exit::Logout => {
                store.clear_session().await?;
                println!("Logged out.");
            }
        }
    }
}

/// Prompt until the user logs in or quits.
async fn login(
    api: &ApiClient,
    store: &FileStore,
    input: &mut Input,
) -> anyhow::Result<Option<Session>> {
    println!("Not signed in. Use /login <user> <password> or /register <user> <password>.");
    while let Some(line) = input.next_line().await? {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some("/login"), Some(user), Some(password)) => match api.login(user, password).await {
                Ok(session) => {
                    store
                        .save_session(session.token(), session.username())
                        .await?;
                    return Ok(Some(session));
                }
                Err(e) => eprintln!("! Login failed: {e}"),
            },
            (Some("/register"), Some(user), Some(password)) => {
                match api.register(user, password).await {
                    Ok(message) => println!("{message}"),
                    Err(e) => eprintln!("! Registration failed: {e}"),
                }
            }
            (Some("/quit"), _, _) => return Ok(None),
            _ => println!("Use /login <user> <password>, /register <user> <password> or /quit."),
        }
    }
    Ok(None)
}

async fn chat(engine: &SyncEngine, input: &mut Input) -> anyhow::Result<Exit> {
    let mut timeline = engine.timeline_stream();
    let mut notices = engine.subscribe_notices();
    let mut connection = engine.watch_connection();
    let mut shown = HashMap::new();

    loop {
        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else {
                    return Ok(Exit::Quit);
                };
                match line.trim() {
                    "/quit" => return Ok(Exit::Quit),
                    "/logout" => return Ok(Exit::Logout),
                    "" => {}
                    text => {
                        if let Err(e) = engine.compose_and_send(text).await {
                            eprintln!("! {e}");
                        }
                    }
                }
            }
            Some(snapshot) = timeline.next() => render(&snapshot, &mut shown),
            Ok(notice) = notices.recv() => match notice {
                Notice::AuthRequired(reason) => {
                    eprintln!("! Session rejected ({reason}), please sign in again.");
                    return Ok(Exit::Logout);
                }
                Notice::Offline { attempts } => {
                    eprintln!("! Offline after {attempts} attempts. Messages stay queued until restart.");
                }
                Notice::StorageUnavailable(reason) => {
                    eprintln!("! Messages could not be saved: {reason}");
                }
            },
            Ok(()) = connection.changed() => {
                let state = *connection.borrow_and_update();
                println!("-- {state:?}");
            }
        }
    }
}

/// Print entries that are new or whose delivery state changed.
fn render(snapshot: &[Message], shown: &mut HashMap<MessageId, bool>) {
    for msg in snapshot {
        let pending = msg.is_pending();
        if shown.insert(msg.id, pending) == Some(pending) {
            continue;
        }
        let marker = match (msg.direction, pending) {
            (Direction::Sent, true) => " (sending)",
            (Direction::Sent, false) => " (sent)",
            (Direction::Received, _) => "",
        };
        println!(
            "[{}] {}: {}{marker}",
            msg.timestamp.format("%H:%M"),
            msg.author,
            msg.text
        );
    }
}
