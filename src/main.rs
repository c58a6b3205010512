//! Parley terminal client
//!
//! Wires the conversation core to the websocket and HTTP transports, reads
//! commands and messages from stdin, and prints timeline updates.

use parley::api::ChatApi;
use parley::config::ClientConfig;
use parley::connection::{ConnectionManager, ConnectionStatus};
use parley::model::{Delivery, Role};
use parley::poller::StatusPoller;
use parley::reconciler::{ChatError, Reconciler, StoreEvent};
use parley::transport::{
    ChannelEndpoint, HttpTransport, LoggingTransport, MemoryTokenProvider, TokenProvider,
    WsTransport,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Client = Reconciler<LoggingTransport<HttpTransport>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging; stdout belongs to the conversation
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ClientConfig::from_env()?;
    tracing::info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        authenticated = config.token.is_some(),
        "Starting Parley"
    );

    let tokens: Arc<dyn TokenProvider> = Arc::new(MemoryTokenProvider::new(config.token.clone()));
    let http = HttpTransport::new(config.api_url.clone(), config.http_timeout, tokens.clone())?;
    let api = ChatApi::new(LoggingTransport::new(http), config.paths.clone());

    let endpoint = ChannelEndpoint::new(
        config.ws_url.clone(),
        config.paths.channel.clone(),
        tokens.clone(),
    );
    let connection = ConnectionManager::spawn(WsTransport::new(tokens), endpoint, config.reconnect);
    let poller = StatusPoller::spawn(connection.clone(), config.status_interval);

    let client: Arc<Client> = Arc::new(Reconciler::new(api, connection.clone()));

    tokio::spawn(render(client.clone()));
    tokio::spawn(print_status(poller.subscribe()));

    if let Err(e) = client.load_conversations().await {
        eprintln!("! could not load conversations: {e}");
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = handle_line(&client, line).await {
            eprintln!("! {e}");
            if matches!(e, ChatError::Auth(_)) {
                break;
            }
        }
        if line == "/quit" {
            break;
        }
    }

    poller.stop();
    connection.shutdown().await;
    tracing::info!("Parley stopped");
    Ok(())
}

async fn handle_line(client: &Client, line: &str) -> Result<(), ChatError> {
    let (command, arg) = line
        .split_once(' ')
        .map_or((line, ""), |(c, a)| (c, a.trim()));

    match command {
        "/new" => {
            let id = client.create_conversation().await?;
            println!("* created {id}");
        }
        "/list" => {
            client.load_conversations().await?;
            let active = client.active_id();
            for conv in client.conversations() {
                let marker = if active.as_deref() == Some(conv.id.as_str()) { ">" } else { " " };
                println!("{marker} {} {} ({:?})", conv.id, conv.title, conv.status);
            }
        }
        "/switch" => client.select_conversation(arg).await?,
        "/delete" => client.delete_conversation(arg).await?,
        "/close" => {
            let id = if arg.is_empty() {
                client.active_id().ok_or(ChatError::NoConversation)?
            } else {
                arg.to_string()
            };
            client.close_conversation(&id).await?;
        }
        "/clear" => client.clear_messages()?,
        "/quit" => {}
        "/help" => print_help(),
        _ => {
            client.send(None, line).await?;
        }
    }
    Ok(())
}

fn print_help() {
    println!("Commands: /new  /list  /switch <id>  /delete <id>  /close [id]  /clear  /quit");
    println!("Anything else is sent to the active conversation.");
}

/// Print timeline entries as they settle
async fn render(client: Arc<Client>) {
    let mut shown: HashSet<String> = HashSet::new();
    let mut events = BroadcastStream::new(client.subscribe());

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Renderer fell behind");
                continue;
            }
        };
        match event {
            StoreEvent::TimelineChanged { conversation_id } => {
                if client.active_id().as_deref() != Some(conversation_id.as_str()) {
                    continue;
                }
                for entry in client.timeline(&conversation_id).unwrap_or_default() {
                    // Local entries are shown once confirmed under their server id
                    if entry.delivery != Delivery::Confirmed && entry.message.role == Role::User {
                        continue;
                    }
                    if shown.insert(entry.message.id.to_string()) {
                        let who = match entry.message.role {
                            Role::User => "you",
                            Role::Assistant => "assistant",
                        };
                        println!("{who}: {}", entry.message.content);
                        for question in &entry.message.related_questions {
                            println!("    - {question}");
                        }
                    }
                }
            }
            StoreEvent::ActiveChanged {
                conversation_id: Some(id),
            } => {
                shown.clear();
                println!("* now in {id}");
            }
            StoreEvent::ActiveChanged {
                conversation_id: None,
            } => println!("* no conversation selected"),
            StoreEvent::ConversationsChanged => {}
            StoreEvent::Error { message } => eprintln!("! {message}"),
            StoreEvent::SessionEnded { reason } => {
                eprintln!("! session ended: {reason}");
            }
        }
    }
}

async fn print_status(mut status: tokio::sync::watch::Receiver<ConnectionStatus>) {
    while status.changed().await.is_ok() {
        let current = *status.borrow_and_update();
        eprintln!("~ {current}");
    }
}
