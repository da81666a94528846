use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::MessagePayload,
};

/// Normalized message, built from the wire payload exactly once at the
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: MessageId,
    pub sender: UserId,
    pub receiver: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Self {
            message_id: payload.message_id,
            sender: payload.sender.into_id(),
            receiver: payload.receiver.into_id(),
            text: payload.text,
            created_at: payload.created_at,
        }
    }
}

/// Loaded message sequence for one peer, merged from history fetches and
/// live pushes. Ids are unique within the sequence; deleted ids are
/// remembered so a stale live echo cannot resurrect a removed message.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    deleted: HashSet<MessageId>,
    last_activity: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.message_id == message_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replaces the sequence with a fresh history fetch, sorted
    /// chronologically. Tombstones reset: a fresh load is authoritative and
    /// may reintroduce previously deleted ids.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        self.messages.clear();
        self.deleted.clear();
        for message in history {
            if self.contains(&message.message_id) {
                continue;
            }
            self.messages.push(message);
        }
        self.messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.recompute_last_activity();
    }

    /// Dedup-append for a live arrival. Returns false when the id is already
    /// present or was deleted since the last history load.
    pub fn append_live(&mut self, message: Message) -> bool {
        if self.deleted.contains(&message.message_id) {
            return false;
        }
        if self.contains(&message.message_id) {
            return false;
        }
        self.messages.push(message);
        self.recompute_last_activity();
        true
    }

    /// Removes a message, remembering the id so later live echoes stay
    /// suppressed. Idempotent; returns whether anything was removed.
    pub fn remove(&mut self, message_id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| &m.message_id != message_id);
        self.deleted.insert(message_id.clone());
        let removed = self.messages.len() != before;
        if removed {
            self.recompute_last_activity();
        }
        removed
    }

    // Deletion can take out the most recently appended entry, so derive by
    // max-scan over creation timestamps rather than tracking last append.
    fn recompute_last_activity(&mut self) {
        self.last_activity = self.messages.iter().map(|m| m.created_at).max();
    }
}
