//! # parley-protocol
//!
//! Wire protocol for the Parley messaging client.
//!
//! Parley speaks the subset of MQTT 3.1.1 a chat client needs. This crate
//! holds the frame types, a stateless codec, and the message id allocator.
//!
//! ## Frame Types
//!
//! - `Connect` / `ConnectAck` - Session handshake
//! - `Subscribe` / `Unsubscribe` (and their acks) - Topic membership
//! - `Publish` / `PublishAck` - Application payloads
//! - `PingRequest` / `PingResponse` - Keep-alive
//! - `Disconnect` - Graceful shutdown
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame};
//!
//! let frame = Frame::publish("org/group/42", b"Hello, world!".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let (decoded, used) = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, frame);
//! assert_eq!(used, encoded.len());
//! ```

pub mod codec;
pub mod frames;
pub mod packet_id;

pub use codec::{decode, decode_from, encode, encode_into, ProtocolError};
pub use frames::{Frame, PacketType, QoS};
pub use packet_id::PacketIdAllocator;
