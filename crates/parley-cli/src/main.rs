//! # Parley
//!
//! Command line chat client.
//!
//! ## Usage
//!
//! ```bash
//! # Run with ./parley.toml or ~/.config/parley/parley.toml
//! parley
//!
//! # Override broker and login from the environment
//! PARLEY_BROKER=tcp://broker.local:1883 PARLEY_USER=u1 parley
//! ```
//!
//! Each stdin line `<conversation> <text>` sends a text message.

mod config;
mod metrics;

use anyhow::Result;
use parley_core::{Client, ClientEvent, MessageStatus, QoS, Sender};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info,parley_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;
    let credentials = config.connect_credentials()?;

    if config.metrics.enabled {
        metrics::init(config.metrics.port)?;
    }

    let client = Client::new(config.client.clone())?;
    client.set_identity(Sender::new(
        config.credentials.user_uid.clone(),
        config.credentials.nickname.clone(),
    ));

    for entry in &config.conversations {
        let conversation = entry.conversation();
        client.join(&conversation, QoS::AtMostOnce)?;
        info!(conversation = %conversation.uid, topic = %conversation.topic, "Joined");
    }
    for agent in &config.queues {
        client.subscribe_queue(agent)?;
    }

    let mut events = client.events();
    info!(host = %credentials.host, port = credentials.port, client_id = %credentials.client_id, "Starting Parley client");
    client.connect(credentials);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if !log_event(&event) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => send_line(&client, &line),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    }

    info!("Shutting down");
    client.shutdown();
    Ok(())
}

/// Log an event. Returns `false` once the client has given up.
fn log_event(event: &ClientEvent) -> bool {
    match event {
        ClientEvent::StateChanged { from, to } => info!(from = %from, to = %to, "State changed"),
        ClientEvent::Connected => info!("Connected"),
        ClientEvent::Disconnected => warn!("Disconnected"),
        ClientEvent::MessageReceived(message) => info!(
            conversation = %message.conversation_id,
            from = %message.sender_display_name,
            kind = message.kind.as_str(),
            "{}",
            message.content.text
        ),
        ClientEvent::TypingReceived {
            conversation_id,
            sender_id,
        } => info!(conversation = %conversation_id, sender = %sender_id, "Typing"),
        ClientEvent::ReadReceiptReceived {
            conversation_id,
            message_uid,
        } => info!(conversation = %conversation_id, message = %message_uid, "Read"),
        ClientEvent::DeliveredReceiptReceived {
            conversation_id,
            message_uid,
        } => info!(conversation = %conversation_id, message = %message_uid, "Delivered"),
        ClientEvent::NoticeReceived {
            conversation_id,
            text,
        } => info!(conversation = %conversation_id, "Notice: {}", text),
        ClientEvent::Error(fault) => {
            error!(kind = fault.kind(), "{}", fault);
            if fault.is_fatal() {
                return false;
            }
        }
    }
    true
}

fn send_line(client: &Client, line: &str) {
    let Some((conversation, text)) = line.trim().split_once(' ') else {
        warn!("Expected `<conversation> <text>`");
        return;
    };
    let message = client.send_text(conversation, text.trim());
    if message.status == MessageStatus::Failed {
        warn!(conversation = %conversation, uid = %message.uid, "Message not sent");
    }
}
