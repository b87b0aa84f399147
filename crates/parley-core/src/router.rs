//! Message routing between conversations and topics.
//!
//! Outbound, the router composes an [`ApplicationMessage`], serializes it
//! and publishes it on the conversation's topic. Inbound, it resolves the
//! topic back to a conversation, decodes the payload and turns it into a
//! [`ClientEvent`] by message kind. Read and delivered receipts are
//! deduplicated per direction: one [`ReceiptLedger`] for receipts we sent,
//! another for receipts we were told about. Receipts authored by our own
//! identity are the broker echoing ours back and are dropped.

use bytes::Bytes;
use parley_protocol::QoS;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionAction, ConnectionMachine};
use crate::event::{ClientEvent, ClientFault};
use crate::message::{ApplicationMessage, MessageContent, MessageKind, MessageStatus, Sender};
use crate::metrics;
use crate::registry::SubscriptionRegistry;

/// Receipt kinds tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiptKind {
    Read,
    Delivered,
}

impl ReceiptKind {
    /// Message kind carrying this receipt.
    #[must_use]
    pub fn message_kind(self) -> MessageKind {
        match self {
            ReceiptKind::Read => MessageKind::Read,
            ReceiptKind::Delivered => MessageKind::Delivered,
        }
    }

    /// Receipt kind of a message, if it is a receipt.
    #[must_use]
    pub fn of(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Read => Some(ReceiptKind::Read),
            MessageKind::Delivered => Some(ReceiptKind::Delivered),
            _ => None,
        }
    }
}

/// Bounded memory of receipt uids already handled.
///
/// Each kind is capped at `capacity` uids. When an insert would exceed the
/// cap, that kind's set is cleared first, so a receipt seen just before a
/// clear can be processed once more.
#[derive(Debug)]
pub struct ReceiptLedger {
    read: HashSet<String>,
    delivered: HashSet<String>,
    capacity: usize,
}

impl ReceiptLedger {
    /// Create a ledger remembering up to `capacity` uids per kind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            read: HashSet::new(),
            delivered: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Check whether `uid` was already handled.
    #[must_use]
    pub fn contains(&self, kind: ReceiptKind, uid: &str) -> bool {
        self.set(kind).contains(uid)
    }

    /// Remember `uid`. Returns `false` if it was already known.
    pub fn record(&mut self, kind: ReceiptKind, uid: &str) -> bool {
        let capacity = self.capacity;
        let set = self.set_mut(kind);
        if set.contains(uid) {
            return false;
        }
        if set.len() >= capacity {
            debug!(kind = ?kind, capacity = capacity, "Receipt ledger full, clearing");
            set.clear();
        }
        set.insert(uid.to_string())
    }

    /// Number of uids remembered for `kind`.
    #[must_use]
    pub fn len(&self, kind: ReceiptKind) -> usize {
        self.set(kind).len()
    }

    fn set(&self, kind: ReceiptKind) -> &HashSet<String> {
        match kind {
            ReceiptKind::Read => &self.read,
            ReceiptKind::Delivered => &self.delivered,
        }
    }

    fn set_mut(&mut self, kind: ReceiptKind) -> &mut HashSet<String> {
        match kind {
            ReceiptKind::Read => &mut self.read,
            ReceiptKind::Delivered => &mut self.delivered,
        }
    }
}

/// A composed outbound message and the work needed to send it.
#[derive(Debug)]
pub struct Outbound {
    /// The message, with status `Sent` or `Failed`.
    pub message: Arc<ApplicationMessage>,
    /// Writes and events for the driver.
    pub actions: Vec<ConnectionAction>,
}

/// Routes application messages.
#[derive(Debug)]
pub struct MessageRouter {
    sent: ReceiptLedger,
    seen: ReceiptLedger,
    identity: Sender,
}

impl MessageRouter {
    /// Create a router whose receipt ledgers hold `receipt_capacity` uids per kind.
    #[must_use]
    pub fn new(receipt_capacity: usize) -> Self {
        Self {
            sent: ReceiptLedger::new(receipt_capacity),
            seen: ReceiptLedger::new(receipt_capacity),
            identity: Sender::default(),
        }
    }

    /// Who outbound messages are attributed to.
    #[must_use]
    pub fn identity(&self) -> &Sender {
        &self.identity
    }

    /// Set who outbound messages are attributed to.
    pub fn set_identity(&mut self, identity: Sender) {
        self.identity = identity;
    }

    /// Receipts this client has published.
    #[must_use]
    pub fn sent_receipts(&self) -> &ReceiptLedger {
        &self.sent
    }

    /// Receipts from peers already reported.
    #[must_use]
    pub fn seen_receipts(&self) -> &ReceiptLedger {
        &self.seen
    }

    /// Compose and publish a message to a conversation.
    ///
    /// Never retries. If there is no session or the conversation has no
    /// topic, nothing is written and the message comes back `Failed`.
    /// Everything except typing notices and receipts is echoed locally as
    /// [`ClientEvent::MessageReceived`].
    pub fn send(
        &mut self,
        machine: &mut ConnectionMachine,
        registry: &SubscriptionRegistry,
        conversation_id: &str,
        kind: MessageKind,
        content: MessageContent,
    ) -> Outbound {
        let mut message = ApplicationMessage::compose(kind, conversation_id, content, &self.identity);
        let mut actions = Vec::new();

        match publish(machine, registry, &message) {
            Ok(writes) => {
                message.status = MessageStatus::Sent;
                actions.extend(writes);
                metrics::record_message(kind.as_str(), "out");
                trace!(uid = %message.uid, conversation = %conversation_id, kind = kind.as_str(), "Message sent");
            }
            Err(reason) => {
                message.status = MessageStatus::Failed;
                warn!(uid = %message.uid, conversation = %conversation_id, reason = %reason, "Send failed");
                metrics::record_error("send_failed");
                actions.push(ConnectionAction::Emit(ClientEvent::Error(
                    ClientFault::SendFailed {
                        uid: message.uid.clone(),
                        reason,
                    },
                )));
            }
        }

        let message = Arc::new(message);
        if !matches!(kind, MessageKind::Typing) && !kind.is_receipt() {
            actions.push(ConnectionAction::Emit(ClientEvent::MessageReceived(
                Arc::clone(&message),
            )));
        }

        Outbound { message, actions }
    }

    /// Publish a receipt for `message_uid`, once.
    ///
    /// Returns `None` when a receipt of this kind was already sent for the
    /// uid. Receipts received from peers do not count. A failed send is not
    /// remembered.
    pub fn send_receipt(
        &mut self,
        machine: &mut ConnectionMachine,
        registry: &SubscriptionRegistry,
        conversation_id: &str,
        kind: ReceiptKind,
        message_uid: &str,
    ) -> Option<Outbound> {
        if self.sent.contains(kind, message_uid) {
            debug!(kind = ?kind, uid = %message_uid, "Receipt already handled");
            return None;
        }

        let outbound = self.send(
            machine,
            registry,
            conversation_id,
            kind.message_kind(),
            MessageContent::text(message_uid),
        );
        if outbound.message.status == MessageStatus::Sent {
            self.sent.record(kind, message_uid);
        }
        Some(outbound)
    }

    /// Turn an inbound publish into an event.
    ///
    /// Returns `None` for unknown topics, undecodable or null payloads,
    /// duplicate receipts and echoes of our own receipts.
    pub fn route_inbound(
        &mut self,
        registry: &SubscriptionRegistry,
        topic: &str,
        payload: &[u8],
    ) -> Option<ClientEvent> {
        let Some(conversation_id) = registry.conversation_for(topic) else {
            warn!(topic = %topic, "Message on unknown topic dropped");
            return None;
        };
        let conversation_id = conversation_id.to_string();

        let mut message = match ApplicationMessage::from_json(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Undecodable message dropped");
                metrics::record_error("decode");
                return None;
            }
        };
        if message.is_null() {
            warn!(topic = %topic, "Message without uid dropped");
            return None;
        }

        metrics::record_message(message.kind.as_str(), "in");
        trace!(uid = %message.uid, topic = %topic, kind = message.kind.as_str(), "Message received");

        if let Some(kind) = ReceiptKind::of(message.kind) {
            let Some(uid) = message.referenced_uid() else {
                warn!(uid = %message.uid, "Receipt without referenced uid dropped");
                return None;
            };
            if self.is_own(&message) {
                trace!(kind = ?kind, uid = %uid, "Own receipt echoed back");
                return None;
            }
            if !self.seen.record(kind, uid) {
                debug!(kind = ?kind, uid = %uid, "Duplicate receipt dropped");
                return None;
            }
            let message_uid = uid.to_string();
            return Some(match kind {
                ReceiptKind::Read => ClientEvent::ReadReceiptReceived {
                    conversation_id,
                    message_uid,
                },
                ReceiptKind::Delivered => ClientEvent::DeliveredReceiptReceived {
                    conversation_id,
                    message_uid,
                },
            });
        }

        match message.kind {
            MessageKind::Typing => Some(ClientEvent::TypingReceived {
                conversation_id,
                sender_id: message.sender_id,
            }),
            MessageKind::Notice => Some(ClientEvent::NoticeReceived {
                conversation_id,
                text: message.content.text,
            }),
            _ => {
                if message.conversation_id.is_empty() {
                    message.conversation_id = conversation_id;
                }
                Some(ClientEvent::MessageReceived(Arc::new(message)))
            }
        }
    }
}

impl MessageRouter {
    fn is_own(&self, message: &ApplicationMessage) -> bool {
        !self.identity.uid.is_empty() && message.sender_id == self.identity.uid
    }
}

fn publish(
    machine: &mut ConnectionMachine,
    registry: &SubscriptionRegistry,
    message: &ApplicationMessage,
) -> Result<Vec<ConnectionAction>, String> {
    let topic = registry
        .topic_for(&message.conversation_id)
        .ok_or_else(|| format!("conversation {} has no topic", message.conversation_id))?;
    let payload = message.to_json().map_err(|e| e.to_string())?;
    machine
        .publish(topic, Bytes::from(payload), QoS::AtMostOnce, false)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerEndpoint, ClientConfig, Credentials};
    use parley_protocol::{codec, Frame};
    use parley_transport::{TransportEvent, TransportEventKind};

    fn connected_machine() -> ConnectionMachine {
        let mut machine = ConnectionMachine::new(ClientConfig::default());
        machine.connect(Credentials::new(
            BrokerEndpoint::parse("broker.test").unwrap(),
            "u1/HTTP/abc",
        ));
        let epoch = machine.epoch();
        machine.handle_transport(TransportEvent {
            epoch,
            kind: TransportEventKind::Opened,
        });
        machine.handle_transport(TransportEvent {
            epoch,
            kind: TransportEventKind::Bytes(codec::encode(&Frame::connect_ack()).unwrap()),
        });
        machine
    }

    fn registry() -> SubscriptionRegistry {
        let mut registry = SubscriptionRegistry::new();
        registry
            .bind("conv1", "org/workgroup/55", QoS::AtMostOnce)
            .unwrap();
        registry
    }

    fn published(actions: &[ConnectionAction]) -> Vec<(String, serde_json::Value)> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Write(bytes) => match codec::decode(bytes).unwrap().0 {
                    Frame::Publish {
                        topic,
                        payload,
                        qos: QoS::AtMostOnce,
                        ..
                    } => Some((topic, serde_json::from_slice(&payload).unwrap())),
                    other => panic!("unexpected frame {:?}", other),
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ledger_dedups_per_kind() {
        let mut ledger = ReceiptLedger::new(10);
        assert!(ledger.record(ReceiptKind::Read, "m1"));
        assert!(!ledger.record(ReceiptKind::Read, "m1"));
        assert!(ledger.record(ReceiptKind::Delivered, "m1"));
        assert!(ledger.contains(ReceiptKind::Read, "m1"));
        assert!(!ledger.contains(ReceiptKind::Read, "m2"));
    }

    #[test]
    fn test_ledger_clears_at_capacity() {
        let mut ledger = ReceiptLedger::new(3);
        for uid in ["a", "b", "c"] {
            assert!(ledger.record(ReceiptKind::Read, uid));
        }
        assert_eq!(ledger.len(ReceiptKind::Read), 3);

        assert!(ledger.record(ReceiptKind::Read, "d"));
        assert_eq!(ledger.len(ReceiptKind::Read), 1);
        // Forgotten after the clear.
        assert!(ledger.record(ReceiptKind::Read, "a"));
    }

    #[test]
    fn test_send_text() {
        let mut machine = connected_machine();
        let mut router = MessageRouter::new(1000);
        router.set_identity(Sender::new("u1", "Ada"));

        let outbound = router.send(
            &mut machine,
            &registry(),
            "conv1",
            MessageKind::Text,
            MessageContent::text("hello"),
        );

        assert_eq!(outbound.message.status, MessageStatus::Sent);
        let publishes = published(&outbound.actions);
        assert_eq!(publishes.len(), 1);
        let (topic, json) = &publishes[0];
        assert_eq!(topic, "org/workgroup/55");
        assert_eq!(json["type"], "TEXT");
        assert_eq!(json["content"]["text"], "hello");
        assert_eq!(json["threadUid"], "conv1");
        assert_eq!(json["userUid"], "u1");
        assert_eq!(json["uid"], outbound.message.uid.as_str());

        assert!(outbound
            .actions
            .contains(&ConnectionAction::Emit(ClientEvent::MessageReceived(
                Arc::clone(&outbound.message)
            ))));
    }

    #[test]
    fn test_send_while_disconnected_fails() {
        let mut machine = ConnectionMachine::new(ClientConfig::default());
        let mut router = MessageRouter::new(1000);

        let outbound = router.send(
            &mut machine,
            &registry(),
            "conv1",
            MessageKind::Image,
            MessageContent::image("https://img/1.png"),
        );

        assert_eq!(outbound.message.status, MessageStatus::Failed);
        assert!(published(&outbound.actions).is_empty());
        assert!(outbound.actions.iter().any(|a| matches!(
            a,
            ConnectionAction::Emit(ClientEvent::Error(ClientFault::SendFailed { uid, .. }))
                if *uid == outbound.message.uid
        )));
    }

    #[test]
    fn test_send_to_unbound_conversation_fails() {
        let mut machine = connected_machine();
        let mut router = MessageRouter::new(1000);

        let outbound = router.send(
            &mut machine,
            &registry(),
            "nowhere",
            MessageKind::Text,
            MessageContent::text("hello"),
        );
        assert_eq!(outbound.message.status, MessageStatus::Failed);
        assert!(published(&outbound.actions).is_empty());
    }

    #[test]
    fn test_typing_is_not_echoed() {
        let mut machine = connected_machine();
        let mut router = MessageRouter::new(1000);

        let outbound = router.send(
            &mut machine,
            &registry(),
            "conv1",
            MessageKind::Typing,
            MessageContent::default(),
        );
        assert_eq!(published(&outbound.actions).len(), 1);
        assert!(!outbound
            .actions
            .iter()
            .any(|a| matches!(a, ConnectionAction::Emit(_))));
    }

    #[test]
    fn test_read_receipt_sent_once() {
        let mut machine = connected_machine();
        let registry = registry();
        let mut router = MessageRouter::new(1000);

        let first = router
            .send_receipt(&mut machine, &registry, "conv1", ReceiptKind::Read, "m1")
            .unwrap();
        let publishes = published(&first.actions);
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].1["type"], "READ");
        assert_eq!(publishes[0].1["content"]["text"], "m1");

        assert!(router
            .send_receipt(&mut machine, &registry, "conv1", ReceiptKind::Read, "m1")
            .is_none());

        // Delivered receipts are tracked separately.
        assert!(router
            .send_receipt(&mut machine, &registry, "conv1", ReceiptKind::Delivered, "m1")
            .is_some());
    }

    #[test]
    fn test_failed_receipt_is_not_remembered() {
        let mut machine = ConnectionMachine::new(ClientConfig::default());
        let registry = registry();
        let mut router = MessageRouter::new(1000);

        let failed = router
            .send_receipt(&mut machine, &registry, "conv1", ReceiptKind::Read, "m1")
            .unwrap();
        assert_eq!(failed.message.status, MessageStatus::Failed);
        assert!(!router.sent_receipts().contains(ReceiptKind::Read, "m1"));
    }

    #[test]
    fn test_peer_receipt_does_not_block_ours() {
        let mut machine = connected_machine();
        let registry = registry();
        let mut router = MessageRouter::new(1000);
        router.set_identity(Sender::new("u1", "Ada"));

        let theirs = br#"{"uid":"r1","type":"READ","userUid":"u9","content":{"text":"m1"}}"#;
        assert!(matches!(
            router.route_inbound(&registry, "org/workgroup/55", theirs),
            Some(ClientEvent::ReadReceiptReceived { .. })
        ));

        let ours = router
            .send_receipt(&mut machine, &registry, "conv1", ReceiptKind::Read, "m1")
            .unwrap();
        assert_eq!(ours.message.status, MessageStatus::Sent);
        assert_eq!(published(&ours.actions).len(), 1);
        assert!(router.seen_receipts().contains(ReceiptKind::Read, "m1"));
        assert!(router.sent_receipts().contains(ReceiptKind::Read, "m1"));
    }

    #[test]
    fn test_own_receipt_does_not_block_peers() {
        let mut machine = connected_machine();
        let registry = registry();
        let mut router = MessageRouter::new(1000);
        router.set_identity(Sender::new("u1", "Ada"));

        let ours = router
            .send_receipt(&mut machine, &registry, "conv1", ReceiptKind::Read, "m1")
            .unwrap();
        let echo = serde_json::to_vec(ours.message.as_ref()).unwrap();
        assert_eq!(router.route_inbound(&registry, "org/workgroup/55", &echo), None);

        let theirs = br#"{"uid":"r2","type":"READ","userUid":"u9","content":{"text":"m1"}}"#;
        assert_eq!(
            router.route_inbound(&registry, "org/workgroup/55", theirs),
            Some(ClientEvent::ReadReceiptReceived {
                conversation_id: "conv1".to_string(),
                message_uid: "m1".to_string()
            })
        );
    }

    #[test]
    fn test_inbound_text_resolves_conversation() {
        let mut router = MessageRouter::new(1000);
        let event = router
            .route_inbound(
                &registry(),
                "org/workgroup/55",
                br#"{"uid":"m1","type":"TEXT","content":{"text":"hi"}}"#,
            )
            .unwrap();

        let ClientEvent::MessageReceived(message) = event else {
            panic!("expected MessageReceived");
        };
        assert_eq!(message.uid, "m1");
        assert_eq!(message.conversation_id, "conv1");
        assert_eq!(message.content.text, "hi");
    }

    #[test]
    fn test_inbound_read_receipt_once() {
        let registry = registry();
        let mut router = MessageRouter::new(1000);
        let payload = br#"{"uid":"r1","type":"READ","content":{"text":"m1"}}"#;

        assert_eq!(
            router.route_inbound(&registry, "org/workgroup/55", payload),
            Some(ClientEvent::ReadReceiptReceived {
                conversation_id: "conv1".to_string(),
                message_uid: "m1".to_string()
            })
        );
        let again = br#"{"uid":"r2","type":"READ","content":{"text":"m1"}}"#;
        assert_eq!(router.route_inbound(&registry, "org/workgroup/55", again), None);

        let delivered = br#"{"uid":"r3","type":"DELIVERED","content":{"text":"m1"}}"#;
        assert!(matches!(
            router.route_inbound(&registry, "org/workgroup/55", delivered),
            Some(ClientEvent::DeliveredReceiptReceived { .. })
        ));
    }

    #[test]
    fn test_inbound_typing_and_notice() {
        let registry = registry();
        let mut router = MessageRouter::new(1000);

        assert_eq!(
            router.route_inbound(
                &registry,
                "org/workgroup/55",
                br#"{"uid":"t1","type":"TYPING","userUid":"u2"}"#
            ),
            Some(ClientEvent::TypingReceived {
                conversation_id: "conv1".to_string(),
                sender_id: "u2".to_string()
            })
        );
        assert_eq!(
            router.route_inbound(
                &registry,
                "org/workgroup/55",
                br#"{"uid":"n1","type":"NOTICE","content":"Agent joined"}"#
            ),
            Some(ClientEvent::NoticeReceived {
                conversation_id: "conv1".to_string(),
                text: "Agent joined".to_string()
            })
        );
    }

    #[test]
    fn test_inbound_drops() {
        let registry = registry();
        let mut router = MessageRouter::new(1000);

        let valid = br#"{"uid":"m1","type":"TEXT"}"#;
        assert_eq!(router.route_inbound(&registry, "org/group/9", valid), None);
        assert_eq!(
            router.route_inbound(&registry, "org/workgroup/55", b"{broken"),
            None
        );
        assert_eq!(
            router.route_inbound(&registry, "org/workgroup/55", br#"{"type":"TEXT"}"#),
            None
        );
        assert_eq!(
            router.route_inbound(
                &registry,
                "org/workgroup/55",
                br#"{"uid":"r1","type":"READ"}"#
            ),
            None
        );
    }

    #[test]
    fn test_payload_conversation_is_kept() {
        let mut router = MessageRouter::new(1000);
        let event = router.route_inbound(
            &registry(),
            "org/workgroup/55",
            br#"{"uid":"m1","threadUid":"thread-9"}"#,
        );
        let Some(ClientEvent::MessageReceived(message)) = event else {
            panic!("expected MessageReceived");
        };
        assert_eq!(message.conversation_id, "thread-9");
    }
}
