//! Conversation to topic bindings.
//!
//! The registry keeps two maps, conversation → subscription and
//! topic → conversation, that are always exact inverses of each other. It
//! survives reconnects: after every successful handshake the client replays
//! it so each bound topic is subscribed once on the new session.

use parley_protocol::QoS;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Maximum topic length in bytes.
pub const MAX_TOPIC_LENGTH: usize = u16::MAX as usize;

/// Topic naming used by chat brokers.
pub mod topics {
    pub const AGENT_PREFIX: &str = "org/agent/";
    pub const WORKGROUP_PREFIX: &str = "org/workgroup/";
    pub const ROBOT_PREFIX: &str = "org/robot/";
    pub const GROUP_PREFIX: &str = "org/group/";
    pub const MEMBER_PREFIX: &str = "org/member/";
    pub const QUEUE_PREFIX: &str = "org/queue/";

    /// Conversation id prefix used for agent queues.
    pub const QUEUE_CONVERSATION_PREFIX: &str = "queue:";

    pub fn agent(uid: &str) -> String {
        format!("{AGENT_PREFIX}{uid}")
    }

    pub fn workgroup(uid: &str) -> String {
        format!("{WORKGROUP_PREFIX}{uid}")
    }

    pub fn robot(uid: &str) -> String {
        format!("{ROBOT_PREFIX}{uid}")
    }

    pub fn group(uid: &str) -> String {
        format!("{GROUP_PREFIX}{uid}")
    }

    pub fn member(uid: &str) -> String {
        format!("{MEMBER_PREFIX}{uid}")
    }

    pub fn queue(agent_uid: &str) -> String {
        format!("{QUEUE_PREFIX}{agent_uid}")
    }

    /// Conversation id an agent's queue is bound under.
    pub fn queue_conversation(agent_uid: &str) -> String {
        format!("{QUEUE_CONVERSATION_PREFIX}{agent_uid}")
    }
}

/// Validate a conversation topic.
///
/// # Errors
///
/// Returns a description of the first problem found.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("Topic cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if topic.contains(['#', '+']) {
        return Err("Conversation topics cannot contain wildcards");
    }
    if topic.contains('\0') {
        return Err("Topic contains NUL");
    }
    Ok(())
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Topic failed validation.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// Conversation id is empty.
    #[error("Conversation id cannot be empty")]
    EmptyConversation,

    /// Topic is already bound to a different conversation.
    #[error("Topic {topic} is already bound to conversation {conversation}")]
    TopicInUse {
        /// Contested topic.
        topic: String,
        /// Current owner.
        conversation: String,
    },

    /// Conversation has no binding.
    #[error("Conversation not subscribed: {0}")]
    NotSubscribed(String),
}

/// A topic binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Bound topic.
    pub topic: String,
    /// Requested QoS.
    pub qos: QoS,
}

/// Result of [`SubscriptionRegistry::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// Same topic and QoS were already bound.
    Unchanged,
    /// The binding is new or its QoS changed.
    Bound {
        /// Previous topic of the conversation, if it moved.
        replaced: Option<String>,
    },
}

/// Bidirectional conversation/topic map.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_conversation: HashMap<String, Subscription>,
    by_topic: HashMap<String, String>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conversation_id` to `topic`.
    ///
    /// Rebinding a conversation to a new topic drops its old topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or owned by another
    /// conversation.
    pub fn bind(
        &mut self,
        conversation_id: &str,
        topic: &str,
        qos: QoS,
    ) -> Result<BindOutcome, RegistryError> {
        if conversation_id.is_empty() {
            return Err(RegistryError::EmptyConversation);
        }
        validate_topic(topic).map_err(RegistryError::InvalidTopic)?;

        if let Some(owner) = self.by_topic.get(topic) {
            if owner != conversation_id {
                return Err(RegistryError::TopicInUse {
                    topic: topic.to_string(),
                    conversation: owner.clone(),
                });
            }
        }

        let previous = self.by_conversation.insert(
            conversation_id.to_string(),
            Subscription {
                topic: topic.to_string(),
                qos,
            },
        );

        let replaced = match previous {
            Some(old) if old.topic == topic && old.qos == qos => return Ok(BindOutcome::Unchanged),
            Some(old) if old.topic != topic => {
                self.by_topic.remove(&old.topic);
                Some(old.topic)
            }
            _ => None,
        };

        self.by_topic
            .insert(topic.to_string(), conversation_id.to_string());

        debug!(
            conversation = %conversation_id,
            topic = %topic,
            replaced = ?replaced,
            "Bound conversation"
        );

        Ok(BindOutcome::Bound { replaced })
    }

    /// Remove the binding of `conversation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation is not bound.
    pub fn unbind(&mut self, conversation_id: &str) -> Result<Subscription, RegistryError> {
        let subscription = self
            .by_conversation
            .remove(conversation_id)
            .ok_or_else(|| RegistryError::NotSubscribed(conversation_id.to_string()))?;
        self.by_topic.remove(&subscription.topic);

        debug!(conversation = %conversation_id, topic = %subscription.topic, "Unbound conversation");
        Ok(subscription)
    }

    /// Topic bound to a conversation.
    #[must_use]
    pub fn topic_for(&self, conversation_id: &str) -> Option<&str> {
        self.by_conversation
            .get(conversation_id)
            .map(|s| s.topic.as_str())
    }

    /// Conversation bound to a topic.
    #[must_use]
    pub fn conversation_for(&self, topic: &str) -> Option<&str> {
        self.by_topic.get(topic).map(String::as_str)
    }

    /// Every binding to resubscribe, ordered by topic.
    #[must_use]
    pub fn replay(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<_> = self.by_conversation.values().cloned().collect();
        subscriptions.sort_by(|a, b| a.topic.cmp(&b.topic));
        subscriptions
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_conversation.len()
    }

    /// Check if nothing is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_conversation.is_empty()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.by_conversation.len() == self.by_topic.len()
            && self
                .by_conversation
                .iter()
                .all(|(conv, sub)| self.by_topic.get(&sub.topic) == Some(conv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("org/workgroup/55").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("org/#").is_err());
        assert!(validate_topic("org/+/55").is_err());
        assert!(validate_topic("org\0x").is_err());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_bind_and_lookup() {
        let mut registry = SubscriptionRegistry::new();
        let outcome = registry
            .bind("conv1", "org/workgroup/55", QoS::AtMostOnce)
            .unwrap();
        assert_eq!(outcome, BindOutcome::Bound { replaced: None });
        assert_eq!(registry.topic_for("conv1"), Some("org/workgroup/55"));
        assert_eq!(registry.conversation_for("org/workgroup/55"), Some("conv1"));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_rebind_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        registry.bind("conv1", "t1", QoS::AtMostOnce).unwrap();
        assert_eq!(
            registry.bind("conv1", "t1", QoS::AtMostOnce).unwrap(),
            BindOutcome::Unchanged
        );
        assert_eq!(
            registry.bind("conv1", "t1", QoS::AtLeastOnce).unwrap(),
            BindOutcome::Bound { replaced: None }
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rebind_drops_old_topic() {
        let mut registry = SubscriptionRegistry::new();
        registry.bind("conv1", "t1", QoS::AtMostOnce).unwrap();
        let outcome = registry.bind("conv1", "t2", QoS::AtMostOnce).unwrap();

        assert_eq!(
            outcome,
            BindOutcome::Bound {
                replaced: Some("t1".to_string())
            }
        );
        assert_eq!(registry.conversation_for("t1"), None);
        assert_eq!(registry.conversation_for("t2"), Some("conv1"));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_topic_owned_by_other_conversation() {
        let mut registry = SubscriptionRegistry::new();
        registry.bind("conv1", "t1", QoS::AtMostOnce).unwrap();

        let err = registry.bind("conv2", "t1", QoS::AtMostOnce).unwrap_err();
        assert_eq!(
            err,
            RegistryError::TopicInUse {
                topic: "t1".to_string(),
                conversation: "conv1".to_string()
            }
        );
        assert_eq!(registry.topic_for("conv2"), None);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_unbind_keeps_maps_inverse() {
        let mut registry = SubscriptionRegistry::new();
        registry.bind("conv1", "t1", QoS::AtMostOnce).unwrap();
        registry.bind("conv2", "t2", QoS::AtMostOnce).unwrap();

        let removed = registry.unbind("conv1").unwrap();
        assert_eq!(removed.topic, "t1");
        assert_eq!(registry.conversation_for("t1"), None);
        assert!(registry.is_consistent());

        assert_eq!(
            registry.unbind("conv1"),
            Err(RegistryError::NotSubscribed("conv1".to_string()))
        );
    }

    #[test]
    fn test_replay_lists_every_topic_once() {
        let mut registry = SubscriptionRegistry::new();
        registry.bind("c", "C", QoS::AtMostOnce).unwrap();
        registry.bind("a", "A", QoS::AtMostOnce).unwrap();
        registry.bind("b", "B", QoS::AtLeastOnce).unwrap();

        let topics: Vec<_> = registry.replay().into_iter().map(|s| s.topic).collect();
        assert_eq!(topics, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_topic_helpers() {
        assert_eq!(topics::agent("a1"), "org/agent/a1");
        assert_eq!(topics::robot("r1"), "org/robot/r1");
        assert_eq!(topics::member("m1"), "org/member/m1");
        assert_eq!(topics::queue("a1"), "org/queue/a1");
        assert_eq!(topics::queue_conversation("a1"), "queue:a1");
    }
}
