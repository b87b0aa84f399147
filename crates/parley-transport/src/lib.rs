//! # parley-transport
//!
//! Byte-stream transports for the Parley messaging client.
//!
//! - **TCP** - Plain socket to a broker
//! - **Memory** - Scripted in-process peer, for tests and simulations
//!
//! ## Transport Abstraction
//!
//! Every transport implements [`Transport`]. Opening never blocks; progress
//! arrives as [`TransportEvent`]s tagged with the epoch of the open that
//! produced them, so a client can ignore events from streams it already
//! abandoned.
//!
//! ```rust,ignore
//! use parley_transport::{EventSink, TcpConfig, TcpTransport, Transport};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut transport = TcpTransport::new(TcpConfig::default())?;
//! transport.open("broker.local", 1883, EventSink::new(1, tx));
//! while let Some(event) = rx.recv().await {
//!     // Feed event.kind to the connection
//! }
//! ```

pub mod memory;
pub mod tcp;
pub mod traits;

pub use memory::{MemoryPeer, MemoryTransport};
pub use tcp::{TcpConfig, TcpTransport};
pub use traits::{
    ConnectionId, Epoch, EventSink, Transport, TransportError, TransportEvent, TransportEventKind,
};
