//! Transport abstraction traits for Parley.
//!
//! A transport owns one full-duplex byte stream to a broker. It never
//! blocks the caller: opening, reading and closing happen in the
//! background and are reported as [`TransportEvent`]s.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Counter identifying one open attempt.
pub type Epoch = u64;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a stream, used to correlate log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let n = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}", n))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Write attempted while no stream is open.
    #[error("Transport not open")]
    NotOpen,

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No async runtime to run the stream on.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// The stream is connected and writable.
    Opened,
    /// The peer closed the stream.
    Closed,
    /// Connecting, reading or writing failed; the stream is gone.
    Error(String),
    /// Bytes arrived, in stream order.
    Bytes(Bytes),
}

/// A stream event tagged with the epoch of the open that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Epoch passed to [`Transport::open`].
    pub epoch: Epoch,
    /// The event itself.
    pub kind: TransportEventKind,
}

/// Where a transport reports events for one open attempt.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: Epoch,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Create a sink that tags every event with `epoch`.
    #[must_use]
    pub fn new(epoch: Epoch, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { epoch, tx }
    }

    /// Epoch this sink tags events with.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Report an event. Returns `false` if nobody is listening anymore.
    pub fn emit(&self, kind: TransportEventKind) -> bool {
        self.tx
            .send(TransportEvent {
                epoch: self.epoch,
                kind,
            })
            .is_ok()
    }

    /// Report that the stream is open.
    pub fn opened(&self) -> bool {
        self.emit(TransportEventKind::Opened)
    }

    /// Report that the peer closed the stream.
    pub fn closed(&self) -> bool {
        self.emit(TransportEventKind::Closed)
    }

    /// Report a stream failure.
    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEventKind::Error(reason.into()))
    }

    /// Report received bytes.
    pub fn bytes(&self, data: Bytes) -> bool {
        self.emit(TransportEventKind::Bytes(data))
    }
}

/// A full-duplex byte stream to one broker endpoint.
///
/// Every `open` is matched by exactly one `close` before the stream is
/// reopened; implementations close a still-open stream at the start of
/// `open`.
pub trait Transport: Send + 'static {
    /// Start connecting to `host:port` in the background.
    ///
    /// Progress is reported through `sink`.
    fn open(&mut self, host: &str, port: u16, sink: EventSink);

    /// Queue bytes for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotOpen`] if the stream is not open; the
    /// bytes are dropped.
    fn write(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the stream immediately. No further events are reported for
    /// the current epoch.
    fn close(&mut self);

    /// Check if the stream is open.
    fn is_open(&self) -> bool;

    /// Get the transport name (e.g., "tcp").
    fn name(&self) -> &'static str;
}
