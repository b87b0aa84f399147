//! Connection state machine for Parley.
//!
//! This module owns the session lifecycle: handshake, keep-alive, connect
//! timeout, reconnection and inbound frame reassembly.
//!
//! # Architecture: Action-Based State Machine
//!
//! [`ConnectionMachine`] performs no I/O. Each input (an API call, a
//! transport event, a timer firing) returns the [`ConnectionAction`]s the
//! driver must carry out: open or close the transport, write bytes, arm
//! timers, replay subscriptions, deliver publishes, emit events.
//!
//! # State Machine
//!
//! ```text
//!                connect()                   ConnectAck(0)
//! ┌──────────────┐ ──────> ┌────────────┐ ─────────────> ┌───────────┐
//! │ Disconnected │         │ Connecting │                │ Connected │
//! └──────────────┘ <─────┐ └────────────┘                └───────────┘
//!        ▲     disconnect()  │  ▲  timeout/error/refused       │ closed/error
//!        │                   ▼  │ delay                        ▼  /missed pong
//!        │            ┌────────┐│┌──────────────┐       ┌──────────────┐
//!        │            │ Failed │─>│ Reconnecting │<──────│ Disconnected │
//!        │            └────────┘ └──────────────┘       └──────────────┘
//! ```
//!
//! Each open attempt gets a fresh epoch. Transport events and timers carry
//! the epoch they were started under; anything older than the current epoch
//! is ignored. A manual disconnect also bumps the epoch.

use bytes::{Bytes, BytesMut};
use parley_protocol::{codec, Frame, PacketIdAllocator, ProtocolError, QoS};
use parley_transport::{Epoch, TransportEvent, TransportEventKind};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, Credentials};
use crate::event::{ClientEvent, ClientFault};
use crate::metrics;

/// SubscribeAck return code for a rejected topic.
const SUBSCRIBE_FAILURE: u8 = 0x80;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    #[default]
    Disconnected,
    /// Transport opening or handshake in flight.
    Connecting,
    /// Handshake accepted.
    Connected,
    /// Waiting out the reconnect delay.
    Reconnecting,
    /// Last attempt failed. Terminal once reconnects are exhausted.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Timers the machine asks the driver to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Bounds transport connect plus handshake.
    ConnectTimeout,
    /// Periodic ping while connected.
    KeepAlive,
    /// Delay before the next attempt.
    Reconnect,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    /// Open the transport; tag its events with `epoch`.
    Open {
        host: String,
        port: u16,
        epoch: Epoch,
    },
    /// Write encoded frame bytes.
    Write(Bytes),
    /// Close the transport.
    Close,
    /// Arm a timer, replacing any running timer of the same kind.
    StartTimer {
        kind: TimerKind,
        after: Duration,
        epoch: Epoch,
    },
    /// Abort every running timer.
    CancelTimers,
    /// Resubscribe every registered topic.
    Replay,
    /// Hand an inbound publish to the router.
    Deliver { topic: String, payload: Bytes },
    /// Publish an event.
    Emit(ClientEvent),
}

/// Errors returned by machine operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Operation needs an established session.
    #[error("Not connected")]
    NotConnected,

    /// Frame could not be encoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Connection state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    config: ClientConfig,
    state: ConnectionState,
    epoch: Epoch,
    credentials: Option<Credentials>,
    /// Set by `disconnect`, cleared by `connect`. Suppresses reconnects.
    manual: bool,
    /// Consecutive failed attempts.
    failures: u32,
    awaiting_pong: bool,
    buffer: BytesMut,
    packet_ids: PacketIdAllocator,
    /// Subscribe message id -> topic, until acknowledged.
    pending_subscriptions: HashMap<u16, String>,
}

impl ConnectionMachine {
    /// Create a machine in `Disconnected` state.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            epoch: 0,
            credentials: None,
            manual: false,
            failures: 0,
            awaiting_pong: false,
            buffer: BytesMut::new(),
            packet_ids: PacketIdAllocator::new(),
            pending_subscriptions: HashMap::new(),
        }
    }

    /// Get current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Get the current epoch.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Consecutive failed attempts since the last successful handshake.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Start connecting with `credentials`.
    ///
    /// No-op while an attempt is in flight or a session is established.
    pub fn connect(&mut self, credentials: Credentials) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(state = %self.state, "Connect ignored, already active");
            return actions;
        }

        self.credentials = Some(credentials);
        self.manual = false;
        self.failures = 0;
        self.begin_attempt(&mut actions);
        actions
    }

    /// Tear the session down and stop reconnecting.
    pub fn disconnect(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        let was_connected = self.is_connected();
        self.manual = true;

        if was_connected {
            self.push_frame_logged(&Frame::Disconnect, &mut actions);
        }
        actions.push(ConnectionAction::Close);
        actions.push(ConnectionAction::CancelTimers);

        self.epoch += 1;
        self.reset_session();
        self.transition(ConnectionState::Disconnected, &mut actions);
        if was_connected {
            actions.push(ConnectionAction::Emit(ClientEvent::Disconnected));
        }

        info!(epoch = self.epoch, "Disconnected by request");
        actions
    }

    /// Feed a transport event.
    pub fn handle_transport(&mut self, event: TransportEvent) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if event.epoch != self.epoch
            || !matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            trace!(
                event_epoch = event.epoch,
                epoch = self.epoch,
                state = %self.state,
                "Ignoring stale transport event"
            );
            return actions;
        }

        match event.kind {
            TransportEventKind::Opened => self.on_opened(&mut actions),
            TransportEventKind::Bytes(data) => self.on_bytes(&data, &mut actions),
            TransportEventKind::Closed => self.fail(
                ClientFault::Transport("connection closed by broker".to_string()),
                &mut actions,
            ),
            TransportEventKind::Error(reason) => {
                self.fail(ClientFault::Transport(reason), &mut actions);
            }
        }
        actions
    }

    /// Feed a timer expiry.
    pub fn handle_timer(&mut self, kind: TimerKind, epoch: Epoch) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if epoch != self.epoch {
            trace!(timer = ?kind, timer_epoch = epoch, epoch = self.epoch, "Ignoring stale timer");
            return actions;
        }

        match (kind, self.state) {
            (TimerKind::ConnectTimeout, ConnectionState::Connecting) => {
                self.fail(ClientFault::ConnectTimeout, &mut actions);
            }
            (TimerKind::KeepAlive, ConnectionState::Connected) => {
                if self.awaiting_pong {
                    self.fail(ClientFault::Liveness, &mut actions);
                } else {
                    self.push_frame_logged(&Frame::PingRequest, &mut actions);
                    self.awaiting_pong = true;
                    self.arm(TimerKind::KeepAlive, self.config.keep_alive(), &mut actions);
                }
            }
            (TimerKind::Reconnect, ConnectionState::Reconnecting) if !self.manual => {
                self.begin_attempt(&mut actions);
            }
            _ => trace!(timer = ?kind, state = %self.state, "Timer not applicable"),
        }
        actions
    }

    /// Publish `payload` to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] without writing anything when
    /// there is no session, or a protocol error if the frame cannot be encoded.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.ensure_connected()?;
        let message_id = (qos != QoS::AtMostOnce).then(|| self.packet_ids.next_id());
        let frame = Frame::Publish {
            topic: topic.to_string(),
            message_id,
            payload,
            qos,
            retain,
            dup: false,
        };

        let mut actions = Vec::new();
        self.push_frame(&frame, &mut actions)?;
        Ok(actions)
    }

    /// Send a Subscribe for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when there is no session.
    pub fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.ensure_connected()?;
        let message_id = self.packet_ids.next_id();

        let mut actions = Vec::new();
        self.push_frame(&Frame::subscribe(message_id, topic, qos), &mut actions)?;
        self.pending_subscriptions
            .insert(message_id, topic.to_string());
        debug!(topic = %topic, message_id = message_id, qos = ?qos, "Subscribing");
        Ok(actions)
    }

    /// Send an Unsubscribe for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when there is no session.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<Vec<ConnectionAction>, ConnectionError> {
        self.ensure_connected()?;
        let message_id = self.packet_ids.next_id();

        let mut actions = Vec::new();
        self.push_frame(&Frame::unsubscribe(message_id, topic), &mut actions)?;
        debug!(topic = %topic, message_id = message_id, "Unsubscribing");
        Ok(actions)
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    fn begin_attempt(&mut self, actions: &mut Vec<ConnectionAction>) {
        let Some((host, port)) = self
            .credentials
            .as_ref()
            .map(|c| (c.host.clone(), c.port))
        else {
            warn!("Connect attempt without credentials");
            return;
        };

        self.epoch += 1;
        self.reset_session();
        actions.push(ConnectionAction::CancelTimers);
        self.transition(ConnectionState::Connecting, actions);
        actions.push(ConnectionAction::Open {
            host: host.clone(),
            port,
            epoch: self.epoch,
        });
        self.arm(
            TimerKind::ConnectTimeout,
            self.config.connect_timeout(),
            actions,
        );

        metrics::record_connect_attempt();
        info!(host = %host, port = port, epoch = self.epoch, attempt = self.failures + 1, "Connecting");
    }

    fn on_opened(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        let Some(credentials) = self.credentials.as_ref() else {
            return;
        };

        let frame = Frame::Connect {
            client_id: credentials.client_id.clone(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            keep_alive_secs: self.config.keep_alive_secs(),
            clean_session: self.config.clean_session,
        };
        debug!(client_id = %credentials.client_id, epoch = self.epoch, "Transport open, sending CONNECT");

        if let Err(e) = self.push_frame(&frame, actions) {
            self.fail(ClientFault::Protocol(e.to_string()), actions);
        }
    }

    fn on_bytes(&mut self, data: &[u8], actions: &mut Vec<ConnectionAction>) {
        metrics::record_bytes(data.len(), "in");
        self.buffer.extend_from_slice(data);

        loop {
            match codec::decode_from(&mut self.buffer) {
                Ok(Some(frame)) => {
                    self.on_frame(frame, actions);
                    if !matches!(
                        self.state,
                        ConnectionState::Connecting | ConnectionState::Connected
                    ) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Dropping malformed frame");
                    self.protocol_fault(e.to_string(), actions);
                }
                Err(e) => {
                    warn!(error = %e, "Stream unreadable, reconnecting");
                    self.fail(ClientFault::Protocol(e.to_string()), actions);
                    break;
                }
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, actions: &mut Vec<ConnectionAction>) {
        let packet = frame.packet_type().name();
        metrics::record_frame(packet, "in");
        trace!(packet = packet, state = %self.state, "Frame received");

        match frame {
            Frame::ConnectAck {
                return_code: 0,
                session_present,
            } if self.state == ConnectionState::Connecting => {
                self.failures = 0;
                self.awaiting_pong = false;
                actions.push(ConnectionAction::CancelTimers);
                self.transition(ConnectionState::Connected, actions);
                actions.push(ConnectionAction::Emit(ClientEvent::Connected));
                if self.config.keep_alive_ms > 0 {
                    self.arm(TimerKind::KeepAlive, self.config.keep_alive(), actions);
                }
                actions.push(ConnectionAction::Replay);
                info!(epoch = self.epoch, session_present = session_present, "Connected");
            }
            Frame::ConnectAck { return_code, .. } if self.state == ConnectionState::Connecting => {
                self.fail(ClientFault::ConnectionRefused(return_code), actions);
            }
            Frame::Publish {
                topic,
                message_id,
                payload,
                qos,
                ..
            } if self.is_connected() => {
                // QoS 2 is acknowledged like QoS 1.
                if let (Some(id), true) = (message_id, qos != QoS::AtMostOnce) {
                    self.push_frame_logged(&Frame::PublishAck { message_id: id }, actions);
                }
                actions.push(ConnectionAction::Deliver { topic, payload });
            }
            Frame::PingResponse => {
                self.awaiting_pong = false;
            }
            Frame::SubscribeAck {
                message_id,
                return_codes,
            } => {
                let topic = self.pending_subscriptions.remove(&message_id);
                if return_codes.contains(&SUBSCRIBE_FAILURE) {
                    let topic = topic.unwrap_or_default();
                    warn!(topic = %topic, message_id = message_id, "Subscription rejected");
                    metrics::record_error("subscription_rejected");
                    actions.push(ConnectionAction::Emit(ClientEvent::Error(
                        ClientFault::SubscriptionRejected { topic },
                    )));
                } else {
                    debug!(topic = ?topic, message_id = message_id, "Subscription acknowledged");
                }
            }
            Frame::UnsubscribeAck { message_id } | Frame::PublishAck { message_id } => {
                debug!(packet = packet, message_id = message_id, "Acknowledged");
            }
            _ => {
                warn!(packet = packet, state = %self.state, "Unexpected frame");
                self.protocol_fault(format!("unexpected {} in state {}", packet, self.state), actions);
            }
        }
    }

    /// Close the stream and move toward a reconnect.
    fn fail(&mut self, fault: ClientFault, actions: &mut Vec<ConnectionAction>) {
        warn!(fault = %fault, state = %self.state, epoch = self.epoch, "Connection failed");
        metrics::record_error(fault.kind());

        let was_connected = self.is_connected();
        self.reset_session();
        actions.push(ConnectionAction::Close);
        actions.push(ConnectionAction::CancelTimers);
        actions.push(ConnectionAction::Emit(ClientEvent::Error(fault)));

        if was_connected {
            self.transition(ConnectionState::Disconnected, actions);
            actions.push(ConnectionAction::Emit(ClientEvent::Disconnected));
        } else {
            self.transition(ConnectionState::Failed, actions);
        }
        self.schedule_reconnect(actions);
    }

    fn schedule_reconnect(&mut self, actions: &mut Vec<ConnectionAction>) {
        if self.manual {
            return;
        }

        self.failures += 1;
        if self.failures >= self.config.max_reconnect_attempts {
            warn!(attempts = self.failures, "Reconnect attempts exhausted");
            metrics::record_error("reconnect_exhausted");
            self.transition(ConnectionState::Failed, actions);
            actions.push(ConnectionAction::Emit(ClientEvent::Error(
                ClientFault::ReconnectExhausted {
                    attempts: self.failures,
                },
            )));
            return;
        }

        metrics::record_reconnect();
        self.transition(ConnectionState::Reconnecting, actions);
        self.arm(
            TimerKind::Reconnect,
            self.config.reconnect_interval(),
            actions,
        );
        debug!(
            attempt = self.failures,
            max = self.config.max_reconnect_attempts,
            delay_ms = self.config.reconnect_interval_ms,
            "Reconnect scheduled"
        );
    }

    fn protocol_fault(&mut self, reason: String, actions: &mut Vec<ConnectionAction>) {
        metrics::record_error("protocol");
        actions.push(ConnectionAction::Emit(ClientEvent::Error(
            ClientFault::Protocol(reason),
        )));
    }

    fn transition(&mut self, to: ConnectionState, actions: &mut Vec<ConnectionAction>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        metrics::set_connected(to == ConnectionState::Connected);
        debug!(from = %from, to = %to, "State changed");
        actions.push(ConnectionAction::Emit(ClientEvent::StateChanged { from, to }));
    }

    fn arm(&self, kind: TimerKind, after: Duration, actions: &mut Vec<ConnectionAction>) {
        actions.push(ConnectionAction::StartTimer {
            kind,
            after,
            epoch: self.epoch,
        });
    }

    fn reset_session(&mut self) {
        self.buffer.clear();
        self.awaiting_pong = false;
        self.pending_subscriptions.clear();
    }

    fn push_frame(
        &self,
        frame: &Frame,
        actions: &mut Vec<ConnectionAction>,
    ) -> Result<(), ProtocolError> {
        let bytes = codec::encode(frame)?;
        metrics::record_frame(frame.packet_type().name(), "out");
        metrics::record_bytes(bytes.len(), "out");
        actions.push(ConnectionAction::Write(bytes));
        Ok(())
    }

    /// For frames whose encoding cannot fail in practice.
    fn push_frame_logged(&self, frame: &Frame, actions: &mut Vec<ConnectionAction>) {
        if let Err(e) = self.push_frame(frame, actions) {
            warn!(packet = frame.packet_type().name(), error = %e, "Failed to encode frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerEndpoint;

    fn config() -> ClientConfig {
        ClientConfig {
            max_reconnect_attempts: 3,
            ..ClientConfig::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials::new(
            BrokerEndpoint::parse("tcp://broker.test:1883").unwrap(),
            "u1/HTTP/abc",
        )
    }

    fn transport(epoch: Epoch, kind: TransportEventKind) -> TransportEvent {
        TransportEvent { epoch, kind }
    }

    fn bytes_of(frame: &Frame) -> TransportEventKind {
        TransportEventKind::Bytes(codec::encode(frame).unwrap())
    }

    fn written(actions: &[ConnectionAction]) -> Vec<Frame> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Write(bytes) => Some(codec::decode(bytes).unwrap().0),
                _ => None,
            })
            .collect()
    }

    fn faults(actions: &[ConnectionAction]) -> Vec<ClientFault> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Emit(ClientEvent::Error(fault)) => Some(fault.clone()),
                _ => None,
            })
            .collect()
    }

    fn opens(actions: &[ConnectionAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, ConnectionAction::Open { .. }))
            .count()
    }

    fn connected() -> ConnectionMachine {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials());
        let epoch = machine.epoch();
        machine.handle_transport(transport(epoch, TransportEventKind::Opened));
        machine.handle_transport(transport(epoch, bytes_of(&Frame::connect_ack())));
        assert!(machine.is_connected());
        machine
    }

    #[test]
    fn test_connect_opens_and_arms_timeout() {
        let mut machine = ConnectionMachine::new(config());
        let actions = machine.connect(credentials());

        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.epoch(), 1);
        assert!(actions.contains(&ConnectionAction::Open {
            host: "broker.test".to_string(),
            port: 1883,
            epoch: 1
        }));
        assert!(actions.contains(&ConnectionAction::StartTimer {
            kind: TimerKind::ConnectTimeout,
            after: Duration::from_secs(30),
            epoch: 1
        }));
        assert!(actions.contains(&ConnectionAction::Emit(ClientEvent::StateChanged {
            from: ConnectionState::Disconnected,
            to: ConnectionState::Connecting
        })));

        // Second connect while in flight is ignored.
        assert!(machine.connect(credentials()).is_empty());
    }

    #[test]
    fn test_open_sends_connect_frame() {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials().with_login("u1", "token"));

        let actions = machine.handle_transport(transport(1, TransportEventKind::Opened));
        assert_eq!(
            written(&actions),
            vec![Frame::Connect {
                client_id: "u1/HTTP/abc".to_string(),
                username: Some("u1".to_string()),
                password: Some("token".to_string()),
                keep_alive_secs: 30,
                clean_session: true,
            }]
        );
    }

    #[test]
    fn test_connect_ack_connects_and_replays() {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials());
        machine.handle_transport(transport(1, TransportEventKind::Opened));

        let actions = machine.handle_transport(transport(1, bytes_of(&Frame::connect_ack())));
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(actions.contains(&ConnectionAction::CancelTimers));
        assert!(actions.contains(&ConnectionAction::Emit(ClientEvent::Connected)));
        assert!(actions.contains(&ConnectionAction::Replay));
        assert!(actions.contains(&ConnectionAction::StartTimer {
            kind: TimerKind::KeepAlive,
            after: Duration::from_secs(30),
            epoch: 1
        }));
    }

    #[test]
    fn test_refused_connect_ack() {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials());
        machine.handle_transport(transport(1, TransportEventKind::Opened));

        let refused = Frame::ConnectAck {
            session_present: false,
            return_code: 5,
        };
        let actions = machine.handle_transport(transport(1, bytes_of(&refused)));

        assert_eq!(faults(&actions), vec![ClientFault::ConnectionRefused(5)]);
        assert!(actions.contains(&ConnectionAction::Close));
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_connect_timeout_schedules_reconnect() {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials());

        let actions = machine.handle_timer(TimerKind::ConnectTimeout, 1);
        assert_eq!(faults(&actions), vec![ClientFault::ConnectTimeout]);
        assert!(actions.contains(&ConnectionAction::Emit(ClientEvent::StateChanged {
            from: ConnectionState::Connecting,
            to: ConnectionState::Failed
        })));
        assert!(actions.contains(&ConnectionAction::StartTimer {
            kind: TimerKind::Reconnect,
            after: Duration::from_secs(3),
            epoch: 1
        }));
        assert_eq!(machine.state(), ConnectionState::Reconnecting);

        let actions = machine.handle_timer(TimerKind::Reconnect, 1);
        assert_eq!(opens(&actions), 1);
        assert_eq!(machine.epoch(), 2);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_stale_inputs_ignored() {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials());
        machine.handle_timer(TimerKind::ConnectTimeout, 1);
        machine.handle_timer(TimerKind::Reconnect, 1);
        assert_eq!(machine.epoch(), 2);

        assert!(machine.handle_timer(TimerKind::ConnectTimeout, 1).is_empty());
        assert!(machine
            .handle_transport(transport(1, TransportEventKind::Opened))
            .is_empty());
        assert!(machine
            .handle_transport(transport(1, TransportEventKind::Error("late".into())))
            .is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_reconnect_bound() {
        let mut machine = ConnectionMachine::new(config());
        let mut total_opens = opens(&machine.connect(credentials()));
        let mut last = Vec::new();

        for _ in 0..10 {
            let epoch = machine.epoch();
            last = machine.handle_transport(transport(
                epoch,
                TransportEventKind::Error("connection refused".into()),
            ));
            if machine.state() == ConnectionState::Failed {
                break;
            }
            total_opens += opens(&machine.handle_timer(TimerKind::Reconnect, epoch));
        }

        assert_eq!(total_opens, 3);
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(machine.failures(), 3);
        assert!(faults(&last).contains(&ClientFault::ReconnectExhausted { attempts: 3 }));
        assert!(faults(&last).iter().any(ClientFault::is_fatal));

        // Nothing scheduled, and a stray reconnect timer does nothing.
        assert!(!last
            .iter()
            .any(|a| matches!(a, ConnectionAction::StartTimer { .. })));
        let epoch = machine.epoch();
        assert!(machine.handle_timer(TimerKind::Reconnect, epoch).is_empty());

        // An explicit connect starts over.
        assert_eq!(opens(&machine.connect(credentials())), 1);
        assert_eq!(machine.failures(), 0);
    }

    #[test]
    fn test_keep_alive_and_missed_pong() {
        let mut machine = connected();
        let epoch = machine.epoch();

        let actions = machine.handle_timer(TimerKind::KeepAlive, epoch);
        assert_eq!(written(&actions), vec![Frame::PingRequest]);

        machine.handle_transport(transport(epoch, bytes_of(&Frame::PingResponse)));
        let actions = machine.handle_timer(TimerKind::KeepAlive, epoch);
        assert_eq!(written(&actions), vec![Frame::PingRequest]);

        // No response this time.
        let actions = machine.handle_timer(TimerKind::KeepAlive, epoch);
        assert!(written(&actions).is_empty());
        assert_eq!(faults(&actions), vec![ClientFault::Liveness]);
        assert!(actions.contains(&ConnectionAction::Close));
        assert!(actions.contains(&ConnectionAction::Emit(ClientEvent::Disconnected)));
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_lost_session_goes_through_disconnected() {
        let mut machine = connected();
        let epoch = machine.epoch();

        let actions = machine.handle_transport(transport(epoch, TransportEventKind::Closed));
        let states: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Emit(ClientEvent::StateChanged { to, .. }) => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Disconnected, ConnectionState::Reconnecting]
        );
    }

    #[test]
    fn test_manual_disconnect() {
        let mut machine = connected();
        let epoch = machine.epoch();

        let actions = machine.disconnect();
        assert_eq!(written(&actions), vec![Frame::Disconnect]);
        assert!(actions.contains(&ConnectionAction::Close));
        assert!(actions.contains(&ConnectionAction::CancelTimers));
        assert!(actions.contains(&ConnectionAction::Emit(ClientEvent::Disconnected)));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.epoch(), epoch + 1);

        // Timers from the old session no longer apply.
        assert!(machine.handle_timer(TimerKind::KeepAlive, epoch).is_empty());
        assert!(machine.handle_timer(TimerKind::Reconnect, epoch).is_empty());
    }

    #[test]
    fn test_disconnect_while_connecting_sends_nothing() {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials());

        let actions = machine.disconnect();
        assert!(written(&actions).is_empty());
        assert!(!actions.contains(&ConnectionAction::Emit(ClientEvent::Disconnected)));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reassembly_across_chunks() {
        let mut machine = ConnectionMachine::new(config());
        machine.connect(credentials());
        machine.handle_transport(transport(1, TransportEventKind::Opened));

        let ack = codec::encode(&Frame::connect_ack()).unwrap();
        assert!(machine
            .handle_transport(transport(1, TransportEventKind::Bytes(ack.slice(..1))))
            .is_empty());
        machine.handle_transport(transport(1, TransportEventKind::Bytes(ack.slice(1..))));
        assert!(machine.is_connected());

        let mut both = BytesMut::new();
        codec::encode_into(&Frame::publish("t1", b"one".to_vec()), &mut both).unwrap();
        codec::encode_into(&Frame::publish("t2", b"two".to_vec()), &mut both).unwrap();
        let tail = both.split_off(both.len() - 2);

        let actions = machine.handle_transport(transport(1, TransportEventKind::Bytes(both.freeze())));
        assert_eq!(
            actions,
            vec![ConnectionAction::Deliver {
                topic: "t1".to_string(),
                payload: Bytes::from_static(b"one")
            }]
        );

        let actions = machine.handle_transport(transport(1, TransportEventKind::Bytes(tail.freeze())));
        assert_eq!(
            actions,
            vec![ConnectionAction::Deliver {
                topic: "t2".to_string(),
                payload: Bytes::from_static(b"two")
            }]
        );
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        let mut machine = connected();
        let epoch = machine.epoch();

        // PINGRESP with reserved flags, then a good publish.
        let mut data = BytesMut::from(&[0xD1, 0x00][..]);
        codec::encode_into(&Frame::publish("t1", b"ok".to_vec()), &mut data).unwrap();

        let actions = machine.handle_transport(transport(epoch, TransportEventKind::Bytes(data.freeze())));
        assert_eq!(faults(&actions).len(), 1);
        assert!(matches!(faults(&actions)[0], ClientFault::Protocol(_)));
        assert!(actions.contains(&ConnectionAction::Deliver {
            topic: "t1".to_string(),
            payload: Bytes::from_static(b"ok")
        }));
        assert!(machine.is_connected());
    }

    #[test]
    fn test_unreadable_length_reconnects() {
        let mut machine = connected();
        let epoch = machine.epoch();

        let data = Bytes::from_static(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        let actions = machine.handle_transport(transport(epoch, TransportEventKind::Bytes(data)));
        assert!(actions.contains(&ConnectionAction::Close));
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_operations_require_connection() {
        let mut machine = ConnectionMachine::new(config());
        assert!(matches!(
            machine.publish("t1", Bytes::from_static(b"hello"), QoS::AtMostOnce, false),
            Err(ConnectionError::NotConnected)
        ));
        assert!(matches!(
            machine.subscribe("t1", QoS::AtMostOnce),
            Err(ConnectionError::NotConnected)
        ));
        assert!(matches!(
            machine.unsubscribe("t1"),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn test_publish_allocates_ids_above_qos0() {
        let mut machine = connected();

        let actions = machine
            .publish("t1", Bytes::from_static(b"a"), QoS::AtMostOnce, false)
            .unwrap();
        assert!(matches!(
            &written(&actions)[0],
            Frame::Publish { message_id: None, .. }
        ));

        let actions = machine
            .publish("t1", Bytes::from_static(b"b"), QoS::AtLeastOnce, true)
            .unwrap();
        assert!(matches!(
            &written(&actions)[0],
            Frame::Publish {
                message_id: Some(_),
                retain: true,
                ..
            }
        ));
    }

    #[test]
    fn test_inbound_qos1_is_acknowledged() {
        let mut machine = connected();
        let epoch = machine.epoch();

        let frame = Frame::Publish {
            topic: "t1".to_string(),
            message_id: Some(42),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
        };
        let actions = machine.handle_transport(transport(epoch, bytes_of(&frame)));
        assert_eq!(written(&actions), vec![Frame::PublishAck { message_id: 42 }]);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_subscription_rejected() {
        let mut machine = connected();
        let epoch = machine.epoch();

        let actions = machine.subscribe("org/group/1", QoS::AtMostOnce).unwrap();
        let Frame::Subscribe { message_id, .. } = written(&actions)[0].clone() else {
            panic!("expected SUBSCRIBE");
        };

        let ack = Frame::SubscribeAck {
            message_id,
            return_codes: vec![0x80],
        };
        let actions = machine.handle_transport(transport(epoch, bytes_of(&ack)));
        assert_eq!(
            faults(&actions),
            vec![ClientFault::SubscriptionRejected {
                topic: "org/group/1".to_string()
            }]
        );
    }

    #[test]
    fn test_unexpected_frame_keeps_session() {
        let mut machine = connected();
        let epoch = machine.epoch();

        let actions = machine.handle_transport(transport(epoch, bytes_of(&Frame::PingRequest)));
        assert!(matches!(
            faults(&actions).as_slice(),
            [ClientFault::Protocol(_)]
        ));
        assert!(machine.is_connected());
    }
}
