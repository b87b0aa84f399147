//! Client facade.
//!
//! A [`Client`] owns one connection. Its state (machine, registry, router,
//! transport, timers) sits behind a single mutex. API calls lock it,
//! compute actions and run them inline; none of them wait on the network.
//! One driver task feeds transport events and timer expiries into the same
//! state in arrival order. Results surface as [`ClientEvent`]s.

use bytes::Bytes;
use parking_lot::Mutex;
use parley_protocol::QoS;
use parley_transport::{
    Epoch, EventSink, TcpConfig, TcpTransport, Transport, TransportError, TransportEvent,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, Credentials};
use crate::connection::{
    ConnectionAction, ConnectionError, ConnectionMachine, ConnectionState, TimerKind,
};
use crate::conversation::Conversation;
use crate::event::{ClientEvent, ClientFault, EventBus};
use crate::message::{ApplicationMessage, MessageContent, MessageKind, Sender};
use crate::metrics;
use crate::registry::{topics, BindOutcome, RegistryError, SubscriptionRegistry};
use crate::router::{MessageRouter, Outbound, ReceiptKind};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected by the connection, e.g. not connected.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Rejected by the subscription registry.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Transport could not be created.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Constructed outside a tokio runtime.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

impl ClientError {
    /// Whether the call failed only because there is no session.
    #[must_use]
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ClientError::Connection(ConnectionError::NotConnected))
    }
}

/// Running timers, one per kind.
struct Timers {
    runtime: Handle,
    tx: mpsc::UnboundedSender<(TimerKind, Epoch)>,
    running: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    fn start(&mut self, kind: TimerKind, after: Duration, epoch: Epoch) {
        let tx = self.tx.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((kind, epoch));
        });
        if let Some(previous) = self.running.insert(kind, handle) {
            previous.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, handle) in self.running.drain() {
            handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

enum Input {
    Transport(TransportEvent),
    Timer(TimerKind, Epoch),
}

/// Everything guarded by the client lock.
struct Shared<T: Transport> {
    machine: ConnectionMachine,
    registry: SubscriptionRegistry,
    router: MessageRouter,
    transport: T,
    timers: Timers,
    events: EventBus,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl<T: Transport> Shared<T> {
    fn handle(&mut self, input: Input) {
        let actions = match input {
            Input::Transport(event) => self.machine.handle_transport(event),
            Input::Timer(kind, epoch) => self.machine.handle_timer(kind, epoch),
        };
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<ConnectionAction>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                ConnectionAction::Open { host, port, epoch } => {
                    let sink = EventSink::new(epoch, self.transport_tx.clone());
                    self.transport.open(&host, port, sink);
                }
                ConnectionAction::Write(bytes) => {
                    if let Err(e) = self.transport.write(bytes) {
                        warn!(transport = self.transport.name(), error = %e, "Write failed");
                        metrics::record_error("transport");
                        self.events.emit(ClientEvent::Error(ClientFault::Transport(format!(
                            "write failed: {}",
                            e
                        ))));
                    }
                }
                ConnectionAction::Close => self.transport.close(),
                ConnectionAction::StartTimer { kind, after, epoch } => {
                    self.timers.start(kind, after, epoch);
                }
                ConnectionAction::CancelTimers => self.timers.cancel_all(),
                ConnectionAction::Replay => {
                    let subscriptions = self.registry.replay();
                    info!(count = subscriptions.len(), "Replaying subscriptions");
                    for subscription in subscriptions {
                        match self.machine.subscribe(&subscription.topic, subscription.qos) {
                            Ok(more) => queue.extend(more),
                            Err(e) => {
                                warn!(topic = %subscription.topic, error = %e, "Resubscribe failed");
                            }
                        }
                    }
                }
                ConnectionAction::Deliver { topic, payload } => {
                    if let Some(event) = self.router.route_inbound(&self.registry, &topic, &payload)
                    {
                        self.events.emit(event);
                    }
                }
                ConnectionAction::Emit(event) => {
                    self.events.emit(event);
                }
            }
        }
    }

    fn subscribe(&mut self, conversation_id: &str, topic: &str, qos: QoS) -> Result<(), ClientError> {
        let outcome = self.registry.bind(conversation_id, topic, qos)?;
        metrics::set_subscriptions(self.registry.len());

        let BindOutcome::Bound { replaced } = outcome else {
            return Ok(());
        };
        if !self.machine.is_connected() {
            debug!(conversation = %conversation_id, topic = %topic, "Subscription deferred until connected");
            return Ok(());
        }

        let mut actions = Vec::new();
        if let Some(previous) = replaced {
            actions.extend(self.machine.unsubscribe(&previous)?);
        }
        actions.extend(self.machine.subscribe(topic, qos)?);
        self.execute(actions);
        Ok(())
    }

    fn unsubscribe(&mut self, conversation_id: &str) -> Result<(), ClientError> {
        let subscription = self.registry.unbind(conversation_id)?;
        metrics::set_subscriptions(self.registry.len());

        if self.machine.is_connected() {
            let actions = self.machine.unsubscribe(&subscription.topic)?;
            self.execute(actions);
        }
        Ok(())
    }

    fn send(
        &mut self,
        conversation_id: &str,
        kind: MessageKind,
        content: MessageContent,
    ) -> Arc<ApplicationMessage> {
        let Outbound { message, actions } = self.router.send(
            &mut self.machine,
            &self.registry,
            conversation_id,
            kind,
            content,
        );
        self.execute(actions);
        message
    }

    fn send_receipt(
        &mut self,
        conversation_id: &str,
        kind: ReceiptKind,
        message_uid: &str,
    ) -> Option<Arc<ApplicationMessage>> {
        let Outbound { message, actions } = self.router.send_receipt(
            &mut self.machine,
            &self.registry,
            conversation_id,
            kind,
            message_uid,
        )?;
        self.execute(actions);
        Some(message)
    }
}

async fn drive<T: Transport>(
    shared: Weak<Mutex<Shared<T>>>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut timer_rx: mpsc::UnboundedReceiver<(TimerKind, Epoch)>,
) {
    loop {
        let input = tokio::select! {
            Some(event) = transport_rx.recv() => Input::Transport(event),
            Some((kind, epoch)) = timer_rx.recv() => Input::Timer(kind, epoch),
            else => break,
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.lock().handle(input);
    }
    debug!("Client driver stopped");
}

/// A messaging client bound to one broker connection.
pub struct Client<T: Transport = TcpTransport> {
    shared: Arc<Mutex<Shared<T>>>,
    events: EventBus,
    driver: JoinHandle<()>,
}

impl Client<TcpTransport> {
    /// Create a client that connects over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = TcpTransport::new(TcpConfig::default())?;
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> Client<T> {
    /// Create a client over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns an error if called outside a tokio runtime.
    pub fn with_transport(config: ClientConfig, transport: T) -> Result<Self, ClientError> {
        let runtime =
            Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;
        let events = EventBus::new(config.event_capacity);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Mutex::new(Shared {
            router: MessageRouter::new(config.receipt_capacity),
            machine: ConnectionMachine::new(config),
            registry: SubscriptionRegistry::new(),
            transport,
            timers: Timers {
                runtime: runtime.clone(),
                tx: timer_tx,
                running: HashMap::new(),
            },
            events: events.clone(),
            transport_tx,
        }));

        let driver = runtime.spawn(drive(Arc::downgrade(&shared), transport_rx, timer_rx));

        Ok(Self {
            shared,
            events,
            driver,
        })
    }

    /// Receive client events. Subscribe before `connect` to see every transition.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Start connecting. Progress arrives as events.
    pub fn connect(&self, credentials: Credentials) {
        let mut shared = self.shared.lock();
        let actions = shared.machine.connect(credentials);
        shared.execute(actions);
    }

    /// Disconnect and stop reconnecting.
    pub fn disconnect(&self) {
        let mut shared = self.shared.lock();
        let actions = shared.machine.disconnect();
        shared.execute(actions);
    }

    /// Check if the session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.lock().machine.is_connected()
    }

    /// Get the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().machine.state()
    }

    /// Attribute outbound messages to `sender`.
    pub fn set_identity(&self, sender: Sender) {
        self.shared.lock().router.set_identity(sender);
    }

    /// Bind a conversation to a topic and subscribe to it.
    ///
    /// While disconnected the binding waits for the next connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or bound to another
    /// conversation.
    pub fn subscribe(&self, conversation_id: &str, topic: &str, qos: QoS) -> Result<(), ClientError> {
        self.shared.lock().subscribe(conversation_id, topic, qos)
    }

    /// Subscribe a conversation on its own topic.
    ///
    /// # Errors
    ///
    /// See [`Client::subscribe`].
    pub fn join(&self, conversation: &Conversation, qos: QoS) -> Result<(), ClientError> {
        self.subscribe(&conversation.uid, &conversation.topic, qos)
    }

    /// Drop a conversation's binding, unsubscribing if connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation is not bound.
    pub fn unsubscribe(&self, conversation_id: &str) -> Result<(), ClientError> {
        self.shared.lock().unsubscribe(conversation_id)
    }

    /// Subscribe to an agent's queue topic.
    ///
    /// # Errors
    ///
    /// See [`Client::subscribe`].
    pub fn subscribe_queue(&self, agent_uid: &str) -> Result<(), ClientError> {
        self.subscribe(
            &topics::queue_conversation(agent_uid),
            &topics::queue(agent_uid),
            QoS::AtMostOnce,
        )
    }

    /// Unsubscribe from an agent's queue topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is not subscribed.
    pub fn unsubscribe_queue(&self, agent_uid: &str) -> Result<(), ClientError> {
        self.unsubscribe(&topics::queue_conversation(agent_uid))
    }

    /// Topic bound to a conversation.
    #[must_use]
    pub fn topic_for(&self, conversation_id: &str) -> Option<String> {
        self.shared
            .lock()
            .registry
            .topic_for(conversation_id)
            .map(str::to_string)
    }

    /// Publish raw bytes.
    ///
    /// A rejection is also reported as [`ClientFault::PublishFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error without writing anything when not connected.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        let mut shared = self.shared.lock();
        match shared.machine.publish(topic, payload.into(), qos, retain) {
            Ok(actions) => {
                shared.execute(actions);
                Ok(())
            }
            Err(e) => {
                warn!(topic = %topic, error = %e, "Publish rejected");
                metrics::record_error("publish_failed");
                shared.events.emit(ClientEvent::Error(ClientFault::PublishFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }));
                Err(e.into())
            }
        }
    }

    /// Send a message of any kind to a conversation.
    ///
    /// `Sent` means the frame was handed to the transport. If the stream is
    /// already gone the write fails and a [`ClientFault::Transport`] error
    /// event follows.
    pub fn send(
        &self,
        conversation_id: &str,
        kind: MessageKind,
        content: MessageContent,
    ) -> Arc<ApplicationMessage> {
        self.shared.lock().send(conversation_id, kind, content)
    }

    /// Send a text message.
    pub fn send_text(&self, conversation_id: &str, text: &str) -> Arc<ApplicationMessage> {
        self.send(conversation_id, MessageKind::Text, MessageContent::text(text))
    }

    /// Send an image by URL.
    pub fn send_image(&self, conversation_id: &str, image_url: &str) -> Arc<ApplicationMessage> {
        self.send(conversation_id, MessageKind::Image, MessageContent::image(image_url))
    }

    /// Send a file by URL.
    pub fn send_file(
        &self,
        conversation_id: &str,
        file_url: &str,
        file_name: &str,
        file_size: u64,
    ) -> Arc<ApplicationMessage> {
        self.send(
            conversation_id,
            MessageKind::File,
            MessageContent::file(file_url, file_name, file_size),
        )
    }

    /// Tell the conversation we are typing.
    pub fn send_typing(&self, conversation_id: &str) -> Arc<ApplicationMessage> {
        self.send(conversation_id, MessageKind::Typing, MessageContent::default())
    }

    /// Mark `message_uid` read. `None` if already done.
    pub fn send_read_receipt(
        &self,
        conversation_id: &str,
        message_uid: &str,
    ) -> Option<Arc<ApplicationMessage>> {
        self.shared
            .lock()
            .send_receipt(conversation_id, ReceiptKind::Read, message_uid)
    }

    /// Mark `message_uid` delivered. `None` if already done.
    pub fn send_delivered_receipt(
        &self,
        conversation_id: &str,
        message_uid: &str,
    ) -> Option<Arc<ApplicationMessage>> {
        self.shared
            .lock()
            .send_receipt(conversation_id, ReceiptKind::Delivered, message_uid)
    }

    /// Disconnect and stop the driver. The client is unusable afterwards.
    pub fn shutdown(&self) {
        self.disconnect();
        self.driver.abort();
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
