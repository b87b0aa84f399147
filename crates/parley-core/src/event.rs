//! Client events and the bus that fans them out.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::ConnectionState;
use crate::message::ApplicationMessage;

/// Faults reported through [`ClientEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientFault {
    /// Socket-level failure or peer close.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A keep-alive ping went unanswered.
    #[error("Broker stopped answering pings")]
    Liveness,

    /// Connect and handshake did not finish in time.
    #[error("Connect timed out")]
    ConnectTimeout,

    /// Broker refused the handshake.
    #[error("Connection refused by broker (return code {0})")]
    ConnectionRefused(u8),

    /// Broker rejected a subscription.
    #[error("Subscription to {topic} rejected by broker")]
    SubscriptionRejected {
        /// Rejected topic.
        topic: String,
    },

    /// Automatic reconnection gave up. Call `connect` to try again.
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },

    /// An outbound message could not be published.
    #[error("Failed to send message {uid}: {reason}")]
    SendFailed {
        /// Uid of the failed message.
        uid: String,
        /// Why it failed.
        reason: String,
    },

    /// A raw publish was rejected before reaching the wire.
    #[error("Publish to {topic} rejected: {reason}")]
    PublishFailed {
        /// Target topic.
        topic: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ClientFault {
    /// Whether the client stopped trying on its own.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientFault::ReconnectExhausted { .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFault::Transport(_) => "transport",
            ClientFault::Protocol(_) => "protocol",
            ClientFault::Liveness => "liveness",
            ClientFault::ConnectTimeout => "connect_timeout",
            ClientFault::ConnectionRefused(_) => "refused",
            ClientFault::SubscriptionRejected { .. } => "subscription_rejected",
            ClientFault::ReconnectExhausted { .. } => "reconnect_exhausted",
            ClientFault::SendFailed { .. } => "send_failed",
            ClientFault::PublishFailed { .. } => "publish_failed",
        }
    }
}

/// Something the application may react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection state moved.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Handshake accepted; subscriptions are being replayed.
    Connected,

    /// An established session ended.
    Disconnected,

    /// A chat message arrived, or a local send was echoed.
    MessageReceived(Arc<ApplicationMessage>),

    /// A peer is typing.
    TypingReceived {
        conversation_id: String,
        sender_id: String,
    },

    /// A peer read a message.
    ReadReceiptReceived {
        conversation_id: String,
        message_uid: String,
    },

    /// A message reached a peer.
    DeliveredReceiptReceived {
        conversation_id: String,
        message_uid: String,
    },

    /// A system notice.
    NoticeReceived {
        conversation_id: String,
        text: String,
    },

    /// Something went wrong.
    Error(ClientFault),
}

/// Broadcast bus for [`ClientEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers reached.
    pub fn emit(&self, event: ClientEvent) -> usize {
        match self.sender.send(event) {
            Ok(count) => count,
            Err(broadcast::error::SendError(event)) => {
                trace!(event = ?event, "No event receivers");
                0
            }
        }
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
