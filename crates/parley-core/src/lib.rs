//! # parley-core
//!
//! Connection lifecycle, subscriptions and message routing for the Parley
//! messaging client.
//!
//! - **Connection** - Sans-I/O state machine: handshake, keep-alive,
//!   timeouts, reconnection, frame reassembly
//! - **Registry** - Conversation ↔ topic bindings, replayed on every connect
//! - **Router** - Application message encoding, dispatch by kind, receipt dedup
//! - **Client** - Facade tying the above to a transport and an event bus
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Client    │────▶│ Connection  │────▶│  Transport  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!    │       │               │ Deliver
//!    ▼       ▼               ▼
//! ┌──────────┐ ┌─────────────┐     ┌─────────────┐
//! │ Registry │ │   Router    │────▶│  Event bus  │
//! └──────────┘ └─────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use parley_core::{BrokerEndpoint, Client, ClientConfig, ClientEvent, Credentials};
//! use parley_protocol::QoS;
//!
//! let client = Client::new(ClientConfig::default())?;
//! let mut events = client.events();
//!
//! let endpoint = BrokerEndpoint::parse("tcp://broker.local:1883")?;
//! client.connect(Credentials::new(endpoint, Credentials::client_id_for("u1", "")));
//! client.subscribe("conv1", "org/workgroup/55", QoS::AtMostOnce)?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::MessageReceived(message) = event {
//!         println!("{}: {}", message.sender_display_name, message.content.text);
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod event;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod router;

pub use client::{Client, ClientError};
pub use config::{BrokerEndpoint, ClientConfig, Credentials, EndpointError};
pub use connection::{
    ConnectionAction, ConnectionError, ConnectionMachine, ConnectionState, TimerKind,
};
pub use conversation::Conversation;
pub use event::{ClientEvent, ClientFault, EventBus};
pub use message::{ApplicationMessage, MessageContent, MessageKind, MessageStatus, Sender};
pub use registry::{RegistryError, Subscription, SubscriptionRegistry};
pub use router::{MessageRouter, ReceiptKind, ReceiptLedger};

pub use parley_protocol::QoS;
