//! Conversations bound to broker topics.

use std::sync::Arc;

use crate::message::ApplicationMessage;
use crate::registry::topics;

/// A chat thread and the topic its traffic flows on.
///
/// The conversation shares its latest message; messages never point back
/// at a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// Conversation identifier.
    pub uid: String,
    /// Topic bound to this conversation.
    pub topic: String,
    /// Display title.
    pub title: String,
    /// Most recent message seen or sent.
    pub last_message: Option<Arc<ApplicationMessage>>,
    /// Messages received since the conversation was last read.
    pub unread_count: u32,
}

impl Conversation {
    /// Create a conversation bound to `topic`.
    #[must_use]
    pub fn new(uid: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            topic: topic.into(),
            title: String::new(),
            last_message: None,
            unread_count: 0,
        }
    }

    /// Group conversation on `org/group/<uid>`.
    #[must_use]
    pub fn group(uid: impl Into<String>) -> Self {
        let uid = uid.into();
        let topic = topics::group(&uid);
        Self::new(uid, topic)
    }

    /// Workgroup conversation on `org/workgroup/<workgroup>`.
    #[must_use]
    pub fn workgroup(uid: impl Into<String>, workgroup_uid: &str) -> Self {
        Self::new(uid, topics::workgroup(workgroup_uid))
    }

    /// One-to-one conversation with an agent on `org/agent/<agent>`.
    #[must_use]
    pub fn agent(uid: impl Into<String>, agent_uid: &str) -> Self {
        Self::new(uid, topics::agent(agent_uid))
    }

    /// Set the display title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Record a message, counting it as unread unless `own` is set.
    pub fn record(&mut self, message: Arc<ApplicationMessage>, own: bool) {
        if !own {
            self.unread_count = self.unread_count.saturating_add(1);
        }
        self.last_message = Some(message);
    }

    /// Reset the unread counter.
    pub fn mark_read(&mut self) {
        self.unread_count = 0;
    }
}
