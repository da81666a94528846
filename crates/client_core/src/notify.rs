use std::time::{Duration, Instant};

use shared::{
    domain::{MessageId, UserId},
    protocol::PeerSummary,
};

use crate::conversation::Message;

/// Fixed lifetime of a banner entry unless its peer is selected first.
pub const NOTIFICATION_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Notification {
    pub message_id: MessageId,
    pub peer: PeerSummary,
    pub text: String,
    pub expires_at: Instant,
}

/// Transient banner entries for messages arriving outside the open
/// conversation. Insertion-ordered (oldest first) and keyed by the
/// triggering message id.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    entries: Vec<Notification>,
}

impl NotificationQueue {
    /// Appends an entry unless the message is the local user's own echo or
    /// an entry for the same message id is already pending.
    pub fn push(
        &mut self,
        message: &Message,
        peer: PeerSummary,
        local_user: &UserId,
        now: Instant,
    ) -> Option<Notification> {
        if &message.sender == local_user {
            return None;
        }
        if self
            .entries
            .iter()
            .any(|n| n.message_id == message.message_id)
        {
            return None;
        }
        let notification = Notification {
            message_id: message.message_id.clone(),
            peer,
            text: message.text.clone(),
            expires_at: now + NOTIFICATION_TTL,
        };
        self.entries.push(notification.clone());
        Some(notification)
    }

    /// Drops every pending entry from `peer`; called when that peer becomes
    /// the selected conversation. Returns the dismissed message ids.
    pub fn dismiss_for(&mut self, peer: &UserId) -> Vec<MessageId> {
        let (dismissed, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|n| &n.peer.user_id == peer);
        self.entries = kept;
        dismissed.into_iter().map(|n| n.message_id).collect()
    }

    pub fn remove(&mut self, message_id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|n| &n.message_id != message_id);
        self.entries.len() != before
    }

    /// Drops entries whose deadline has passed; returns their message ids.
    pub fn prune(&mut self, now: Instant) -> Vec<MessageId> {
        let (expired, kept): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|n| n.expires_at <= now);
        self.entries = kept;
        expired.into_iter().map(|n| n.message_id).collect()
    }

    pub fn pending(&self) -> &[Notification] {
        &self.entries
    }
}
