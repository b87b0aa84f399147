//! In-memory transport.
//!
//! [`MemoryTransport`] is driven by a [`MemoryPeer`] that plays the broker
//! side: it decides when the stream opens, injects bytes and failures, and
//! observes every write. Used to exercise clients without sockets.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{EventSink, Transport, TransportError};

#[derive(Debug, Default)]
struct MemoryState {
    sink: Option<EventSink>,
    is_open: bool,
    opens: Vec<(String, u16)>,
    closes: usize,
}

/// Client side of an in-memory stream.
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    writes: mpsc::UnboundedSender<Bytes>,
}

/// Broker side of an in-memory stream.
pub struct MemoryPeer {
    state: Arc<Mutex<MemoryState>>,
    writes: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected transport/peer pair.
#[must_use]
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let state = Arc::new(Mutex::new(MemoryState::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            state: Arc::clone(&state),
            writes: tx,
        },
        MemoryPeer { state, writes: rx },
    )
}

impl Transport for MemoryTransport {
    fn open(&mut self, host: &str, port: u16, sink: EventSink) {
        let mut state = self.state.lock();
        if state.sink.take().is_some() {
            state.closes += 1;
        }
        state.is_open = false;
        state.opens.push((host.to_string(), port));
        state.sink = Some(sink);
    }

    fn write(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.state.lock().is_open {
            return Err(TransportError::NotOpen);
        }
        self.writes
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.sink.take().is_some() {
            state.closes += 1;
        }
        state.is_open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl MemoryPeer {
    /// Complete the pending open. Returns `false` if nothing is pending.
    pub fn accept(&self) -> bool {
        let mut state = self.state.lock();
        match &state.sink {
            Some(sink) if !state.is_open => {
                let sink = sink.clone();
                state.is_open = true;
                drop(state);
                sink.opened()
            }
            _ => false,
        }
    }

    /// Deliver bytes to the client. Returns `false` if the stream is not open.
    pub fn send(&self, data: impl Into<Bytes>) -> bool {
        match self.open_sink() {
            Some(sink) => sink.bytes(data.into()),
            None => false,
        }
    }

    /// Close the stream from the broker side.
    pub fn hang_up(&self) -> bool {
        self.terminate(|sink| sink.closed())
    }

    /// Fail the stream (or the pending open) with `reason`.
    pub fn fail(&self, reason: &str) -> bool {
        self.terminate(|sink| sink.error(reason))
    }

    /// Wait for the next write from the client.
    pub async fn next_write(&mut self) -> Option<Bytes> {
        self.writes.recv().await
    }

    /// Take a write if one is already queued.
    pub fn try_next_write(&mut self) -> Option<Bytes> {
        self.writes.try_recv().ok()
    }

    /// Number of times the client opened the stream.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().opens.len()
    }

    /// Number of times the client closed an opened stream.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Host and port of the latest open.
    #[must_use]
    pub fn last_open(&self) -> Option<(String, u16)> {
        self.state.lock().opens.last().cloned()
    }

    /// Epoch of the pending or open stream.
    #[must_use]
    pub fn epoch(&self) -> Option<u64> {
        self.state.lock().sink.as_ref().map(EventSink::epoch)
    }

    fn open_sink(&self) -> Option<EventSink> {
        let state = self.state.lock();
        if state.is_open {
            state.sink.clone()
        } else {
            None
        }
    }

    fn terminate(&self, report: impl FnOnce(&EventSink) -> bool) -> bool {
        let sink = {
            let mut state = self.state.lock();
            state.is_open = false;
            state.sink.clone()
        };
        sink.is_some_and(|sink| report(&sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TransportEventKind;

    #[test]
    fn test_write_requires_accept() {
        let (mut transport, mut peer) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.open("broker.test", 1883, EventSink::new(1, tx));
        assert_eq!(peer.last_open(), Some(("broker.test".to_string(), 1883)));
        assert!(transport.write(Bytes::from_static(b"early")).is_err());

        assert!(peer.accept());
        assert_eq!(rx.try_recv().unwrap().kind, TransportEventKind::Opened);

        transport.write(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(peer.try_next_write(), Some(Bytes::from_static(b"hello")));
    }

    #[test]
    fn test_close_and_reopen_are_counted() {
        let (mut transport, peer) = pair();
        let (tx, _rx) = mpsc::unbounded_channel();

        transport.open("a", 1, EventSink::new(1, tx.clone()));
        transport.open("a", 1, EventSink::new(2, tx));
        assert_eq!(peer.open_count(), 2);
        assert_eq!(peer.close_count(), 1);
        assert_eq!(peer.epoch(), Some(2));

        transport.close();
        assert_eq!(peer.close_count(), 2);
        assert!(!peer.accept());
    }

    #[test]
    fn test_peer_failures() {
        let (mut transport, peer) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.open("a", 1, EventSink::new(4, tx));
        assert!(peer.fail("refused"));
        assert_eq!(
            rx.try_recv().unwrap().kind,
            TransportEventKind::Error("refused".to_string())
        );
        assert!(!transport.is_open());
        assert!(!peer.send(Bytes::from_static(b"x")));
    }
}
