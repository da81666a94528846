use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::domain::UserId;
use storage::{ActivityStore, MemoryActivityStore};
use tracing::warn;

/// Per-peer "last chatted" state as it should render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastActivity {
    /// No history fetch has completed for this peer yet.
    Unknown,
    /// A fetch confirmed the conversation has no messages.
    Empty,
    At(DateTime<Utc>),
}

/// Derives unread counts and last-activity times from history fetches and
/// live events, persisting through its [`ActivityStore`] on every change so
/// a restart restores prior state.
pub struct ActivityTracker {
    state: storage::ActivityState,
    store: Arc<dyn ActivityStore>,
}

impl ActivityTracker {
    pub async fn load(store: Arc<dyn ActivityStore>) -> anyhow::Result<Self> {
        let state = store.load().await?;
        Ok(Self { state, store })
    }

    pub fn ephemeral() -> Self {
        Self {
            state: storage::ActivityState::default(),
            store: Arc::new(MemoryActivityStore::new()),
        }
    }

    pub fn unread(&self, peer: &UserId) -> u64 {
        self.state.unread.get(peer).copied().unwrap_or(0)
    }

    pub fn last_activity(&self, peer: &UserId) -> LastActivity {
        match self.state.last_activity.get(peer) {
            None => LastActivity::Unknown,
            Some(None) => LastActivity::Empty,
            Some(Some(at)) => LastActivity::At(*at),
        }
    }

    /// One increment per live message that arrived outside the open
    /// conversation. The caller guarantees the peer is not selected.
    pub async fn record_incoming(&mut self, peer: &UserId) -> u64 {
        let count = self.state.unread.entry(peer.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        self.persist().await;
        count
    }

    /// Zeroes the unread badge; called exactly when `peer` becomes the
    /// selected conversation.
    pub async fn clear(&mut self, peer: &UserId) {
        // Absent and zero render the same; only persist a real transition.
        if self.state.unread.insert(peer.clone(), 0).unwrap_or(0) != 0 {
            self.persist().await;
        }
    }

    /// Overwrites last-activity; `None` means "fetched, no messages yet".
    pub async fn touch(&mut self, peer: &UserId, at: Option<DateTime<Utc>>) {
        if self.state.last_activity.insert(peer.clone(), at) != Some(at) {
            self.persist().await;
        }
    }

    // Persistence failures are not fatal: the in-memory view stays
    // consistent and the next successful save catches up.
    async fn persist(&self) {
        if let Err(err) = self.store.save(&self.state).await {
            warn!(error = %err, "failed to persist activity state");
        }
    }
}
