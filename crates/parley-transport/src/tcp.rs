//! TCP transport implementation.
//!
//! Each open spawns one task that connects, then services writes and reads
//! on the same stream until it fails or is closed. Closing an open stream
//! lets the task flush queued writes before shutting the socket down.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::traits::{ConnectionId, EventSink, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Read buffer capacity reserved before each read.
    pub read_buffer_size: usize,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            nodelay: true,
        }
    }
}

/// One open attempt.
struct TcpSession {
    id: ConnectionId,
    writer: mpsc::UnboundedSender<Bytes>,
    is_open: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// TCP transport.
pub struct TcpTransport {
    config: TcpConfig,
    runtime: Handle,
    session: Option<TcpSession>,
}

impl TcpTransport {
    /// Create a new TCP transport bound to the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a tokio runtime.
    pub fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let runtime =
            Handle::try_current().map_err(|e| TransportError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(config, runtime))
    }

    /// Create a new TCP transport that spawns onto `runtime`.
    #[must_use]
    pub fn with_handle(config: TcpConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            session: None,
        }
    }

    /// Get the ID of the current stream, if one was opened.
    #[must_use]
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.session.as_ref().map(|s| &s.id)
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, host: &str, port: u16, sink: EventSink) {
        self.close();

        let id = ConnectionId::generate();
        let (writer, outgoing) = mpsc::unbounded_channel();
        let is_open = Arc::new(AtomicBool::new(false));

        debug!(connection = %id, host = %host, port = port, epoch = sink.epoch(), "Opening TCP stream");

        let task = self.runtime.spawn(run_stream(
            id.clone(),
            format!("{}:{}", host, port),
            self.config.clone(),
            Arc::clone(&is_open),
            outgoing,
            sink,
        ));

        self.session = Some(TcpSession {
            id,
            writer,
            is_open,
            task,
        });
    }

    fn write(&mut self, data: Bytes) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotOpen)?;
        if !session.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        session
            .writer
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            // An open stream flushes queued writes, then sees the queue close.
            if !session.is_open.swap(false, Ordering::SeqCst) {
                session.task.abort();
            }
            debug!(connection = %session.id, "TCP stream closed");
        }
    }

    fn is_open(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.is_open.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_stream(
    id: ConnectionId,
    addr: String,
    config: TcpConfig,
    is_open: Arc<AtomicBool>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    sink: EventSink,
) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(connection = %id, addr = %addr, error = %e, "TCP connect failed");
            sink.error(format!("connect to {} failed: {}", addr, e));
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(config.nodelay) {
        debug!(connection = %id, error = %e, "Failed to set TCP_NODELAY");
    }

    is_open.store(true, Ordering::SeqCst);
    debug!(connection = %id, addr = %addr, "TCP stream connected");
    sink.opened();

    let (mut reader, mut writer) = stream.into_split();
    let mut read_buffer = BytesMut::with_capacity(config.read_buffer_size);

    loop {
        read_buffer.reserve(config.read_buffer_size);

        tokio::select! {
            data = outgoing.recv() => match data {
                Some(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        is_open.store(false, Ordering::SeqCst);
                        warn!(connection = %id, error = %e, "TCP write failed");
                        sink.error(format!("write failed: {}", e));
                        return;
                    }
                }
                None => {
                    let _ = writer.shutdown().await;
                    debug!(connection = %id, "TCP stream shut down");
                    return;
                }
            },

            read = reader.read_buf(&mut read_buffer) => match read {
                Ok(0) => {
                    is_open.store(false, Ordering::SeqCst);
                    debug!(connection = %id, "TCP stream closed by peer");
                    sink.closed();
                    return;
                }
                Ok(_) => {
                    sink.bytes(read_buffer.split().freeze());
                }
                Err(e) => {
                    is_open.store(false, Ordering::SeqCst);
                    warn!(connection = %id, error = %e, "TCP read failed");
                    sink.error(format!("read failed: {}", e));
                    return;
                }
            },
        }
    }
}
