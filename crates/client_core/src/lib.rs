use std::{collections::HashMap, sync::Arc, time::Instant};

use reqwest::Client;
use shared::{
    domain::{MessageId, UserId},
    protocol::{MessagePayload, PeerSummary, SendMessageRequest, ServerEvent},
};
use storage::ActivityStore;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod channel;
pub mod conversation;
pub mod error;
pub mod notify;
pub mod tracker;

pub use channel::{ChannelEvent, RealtimeChannel, WsChannel};
pub use conversation::{Conversation, Message};
pub use error::{ClientError, Result};
pub use notify::{Notification, NotificationQueue, NOTIFICATION_TTL};
pub use tracker::{ActivityTracker, LastActivity};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// State-change notifications for an embedding UI, emitted in the order the
/// mutations happened.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    FriendsUpdated,
    SelectionChanged(Option<UserId>),
    ConversationUpdated { peer_id: UserId },
    /// A relevant message was appended; the view should pin to the newest.
    ScrollToNewest { peer_id: UserId },
    UnreadChanged { peer_id: UserId, count: u64 },
    NotificationPushed(Notification),
    NotificationDismissed { message_id: MessageId },
    Error(String),
}

/// Client-side coordinator for the messaging screens: owns which peer is
/// selected, merges REST history with live channel events per peer, and
/// drives the unread tracker and notification queue.
pub struct ChatClient {
    http: Client,
    server_url: String,
    bearer_token: String,
    local_user: UserId,
    channel: Arc<dyn RealtimeChannel>,
    inner: Mutex<ClientInner>,
    events: broadcast::Sender<ClientEvent>,
}

struct ClientInner {
    friends: Vec<PeerSummary>,
    selected: Option<UserId>,
    conversations: HashMap<UserId, Conversation>,
    tracker: ActivityTracker,
    notifications: NotificationQueue,
    /// Live arrivals buffered while a history fetch for the peer is in
    /// flight; re-applied dedup-append after the replace.
    replay_buffers: HashMap<UserId, Vec<Message>>,
    /// Stale-response guard: only the newest fetch per peer may apply, and
    /// only while that peer is still selected.
    history_generation: HashMap<UserId, u64>,
    next_generation: u64,
    pump_task: Option<JoinHandle<()>>,
}

impl ChatClient {
    pub async fn new(
        server_url: impl Into<String>,
        bearer_token: impl Into<String>,
        local_user: UserId,
        channel: Arc<dyn RealtimeChannel>,
        store: Arc<dyn ActivityStore>,
    ) -> Result<Arc<Self>> {
        let tracker = ActivityTracker::load(store)
            .await
            .map_err(ClientError::Store)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into(),
            bearer_token: bearer_token.into(),
            local_user,
            channel,
            inner: Mutex::new(ClientInner {
                friends: Vec::new(),
                selected: None,
                conversations: HashMap::new(),
                tracker,
                notifications: NotificationQueue::default(),
                replay_buffers: HashMap::new(),
                history_generation: HashMap::new(),
                next_generation: 0,
                pump_task: None,
            }),
            events,
        }))
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Starts the pump that routes realtime channel events into the
    /// synchronizer. Call once after construction.
    pub async fn start(self: &Arc<Self>) {
        let mut rx = self.channel.subscribe();
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ChannelEvent::Connected) => {
                        // Reconnects lose room membership; rejoin the open
                        // conversation's room (the channel itself already
                        // rejoined the local user's room).
                        let selected = client.inner.lock().await.selected.clone();
                        if let Some(peer_id) = selected {
                            if let Err(err) = client.channel.join_room(&peer_id).await {
                                warn!(peer_id = %peer_id, error = %err, "room rejoin failed");
                            }
                        }
                    }
                    Ok(ChannelEvent::Server(ServerEvent::NewMessage { message })) => {
                        client.ingest_live(message).await;
                    }
                    Ok(ChannelEvent::Server(ServerEvent::MessageDeleted { message_id })) => {
                        client.ingest_deleted(&message_id).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event pump lagged behind realtime channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.inner.lock().await.pump_task.replace(task) {
            previous.abort();
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.lock().await.pump_task.take() {
            task.abort();
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url.trim_end_matches('/'))
    }

    /// Fetches and caches the friends list; peers must be known before they
    /// can be selected or attributed in notifications.
    pub async fn load_friends(&self) -> Result<Vec<PeerSummary>> {
        let response = self
            .http
            .get(self.url("/api/friends/list"))
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;
        let friends: Vec<PeerSummary> = error::check_status(response).await?.json().await?;
        self.inner.lock().await.friends = friends.clone();
        let _ = self.events.send(ClientEvent::FriendsUpdated);
        Ok(friends)
    }

    pub async fn friends(&self) -> Vec<PeerSummary> {
        self.inner.lock().await.friends.clone()
    }

    pub async fn selected_peer(&self) -> Option<UserId> {
        self.inner.lock().await.selected.clone()
    }

    pub async fn conversation_messages(&self, peer_id: &UserId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .conversations
            .get(peer_id)
            .map(|c| c.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn unread(&self, peer_id: &UserId) -> u64 {
        self.inner.lock().await.tracker.unread(peer_id)
    }

    pub async fn last_activity(&self, peer_id: &UserId) -> LastActivity {
        self.inner.lock().await.tracker.last_activity(peer_id)
    }

    /// Snapshot of pending notifications, never including expired entries.
    pub async fn notifications(&self) -> Vec<Notification> {
        let mut inner = self.inner.lock().await;
        for message_id in inner.notifications.prune(Instant::now()) {
            let _ = self
                .events
                .send(ClientEvent::NotificationDismissed { message_id });
        }
        inner.notifications.pending().to_vec()
    }

    /// Makes `peer_id` the open conversation. Also the deep-link entry
    /// point: an id missing from the known friends list fails with
    /// [`ClientError::PeerNotFound`] and leaves the selection unchanged.
    ///
    /// Side effects in order: join the peer's realtime room, trigger a
    /// history load, zero the unread badge, drop the peer's notifications.
    pub async fn select_peer(self: &Arc<Self>, peer_id: &UserId) -> Result<()> {
        let peer = {
            let inner = self.inner.lock().await;
            inner.friends.iter().find(|f| &f.user_id == peer_id).cloned()
        };
        let Some(peer) = peer else {
            return Err(ClientError::PeerNotFound(peer_id.clone()));
        };

        if let Err(err) = self.channel.join_room(&peer.user_id).await {
            warn!(peer_id = %peer.user_id, error = %err, "room join for selected peer failed");
        }

        {
            let mut inner = self.inner.lock().await;
            inner.selected = Some(peer.user_id.clone());
            inner.conversations.entry(peer.user_id.clone()).or_default();
        }
        let _ = self
            .events
            .send(ClientEvent::SelectionChanged(Some(peer.user_id.clone())));

        self.spawn_history_load(peer.user_id.clone());

        let mut inner = self.inner.lock().await;
        inner.tracker.clear(&peer.user_id).await;
        let _ = self.events.send(ClientEvent::UnreadChanged {
            peer_id: peer.user_id.clone(),
            count: 0,
        });
        for message_id in inner.notifications.dismiss_for(&peer.user_id) {
            let _ = self
                .events
                .send(ClientEvent::NotificationDismissed { message_id });
        }
        Ok(())
    }

    /// Navigating away. Conversation state stays cached for fast reselect.
    pub async fn deselect(&self) {
        let mut inner = self.inner.lock().await;
        if inner.selected.take().is_some() {
            let _ = self.events.send(ClientEvent::SelectionChanged(None));
        }
    }

    fn spawn_history_load(self: &Arc<Self>, peer_id: UserId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.load_history(&peer_id).await {
                let _ = client
                    .events
                    .send(ClientEvent::Error(format!(
                        "history load for {peer_id} failed: {err}"
                    )));
            }
        });
    }

    /// Fetches the peer's message history and replaces the cached sequence.
    ///
    /// A stale resolution (superseded by a newer fetch, or the peer is no
    /// longer selected) is discarded wholesale. Live messages that raced the
    /// fetch are re-applied dedup-append after the replace. On failure the
    /// previous sequence is left untouched; retry is the caller's call.
    pub async fn load_history(&self, peer_id: &UserId) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.history_generation.insert(peer_id.clone(), generation);
            inner.replay_buffers.insert(peer_id.clone(), Vec::new());
            generation
        };

        let fetched: Result<Vec<MessagePayload>> = async {
            let response = self
                .http
                .get(self.url(&format!("/api/messages/{peer_id}")))
                .bearer_auth(&self.bearer_token)
                .send()
                .await?;
            Ok(error::check_status(response).await?.json().await?)
        }
        .await;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let current = inner.history_generation.get(peer_id) == Some(&generation);
        let still_selected = inner.selected.as_ref() == Some(peer_id);
        if !current || !still_selected {
            info!(peer_id = %peer_id, "discarding stale history response");
            return Ok(());
        }
        inner.history_generation.remove(peer_id);
        let replay = inner.replay_buffers.remove(peer_id).unwrap_or_default();

        let history = fetched?;

        let conversation = inner.conversations.entry(peer_id.clone()).or_default();
        conversation.replace_history(history.into_iter().map(Message::from).collect());
        for message in replay {
            conversation.append_live(message);
        }
        let last = conversation.last_activity();
        inner.tracker.touch(peer_id, last).await;
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            peer_id: peer_id.clone(),
        });
        let _ = self.events.send(ClientEvent::ScrollToNewest {
            peer_id: peer_id.clone(),
        });
        Ok(())
    }

    /// Routes one live `newMessage` event. Relevant to the open conversation
    /// when the selected peer is its sender or receiver; anything else feeds
    /// the unread tracker and notification queue instead.
    async fn ingest_live(self: &Arc<Self>, payload: MessagePayload) {
        let message = Message::from(payload);
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let relevant = inner
            .selected
            .as_ref()
            .is_some_and(|s| &message.sender == s || &message.receiver == s);

        if relevant {
            let selected = match inner.selected.clone() {
                Some(selected) => selected,
                None => return,
            };
            if let Some(buffer) = inner.replay_buffers.get_mut(&selected) {
                buffer.push(message.clone());
            }
            let conversation = inner.conversations.entry(selected.clone()).or_default();
            if conversation.append_live(message) {
                let last = conversation.last_activity();
                inner.tracker.touch(&selected, last).await;
                let _ = self.events.send(ClientEvent::ConversationUpdated {
                    peer_id: selected.clone(),
                });
                let _ = self
                    .events
                    .send(ClientEvent::ScrollToNewest { peer_id: selected });
            }
            return;
        }

        if message.sender == self.local_user {
            // Multi-tab echo of our own outbound message.
            return;
        }

        let count = inner.tracker.record_incoming(&message.sender).await;
        let _ = self.events.send(ClientEvent::UnreadChanged {
            peer_id: message.sender.clone(),
            count,
        });

        let Some(peer) = inner
            .friends
            .iter()
            .find(|f| f.user_id == message.sender)
            .cloned()
        else {
            return;
        };
        if let Some(notification) =
            inner
                .notifications
                .push(&message, peer, &self.local_user, Instant::now())
        {
            let _ = self
                .events
                .send(ClientEvent::NotificationPushed(notification.clone()));
            self.spawn_notification_expiry(notification.message_id);
        }
    }

    fn spawn_notification_expiry(self: &Arc<Self>, message_id: MessageId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(NOTIFICATION_TTL).await;
            let mut inner = client.inner.lock().await;
            if inner.notifications.remove(&message_id) {
                let _ = client
                    .events
                    .send(ClientEvent::NotificationDismissed { message_id });
            }
        });
    }

    /// Mirrors a server-pushed deletion into the open conversation.
    async fn ingest_deleted(&self, message_id: &MessageId) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(selected) = inner.selected.clone() else {
            return;
        };
        let Some(conversation) = inner.conversations.get_mut(&selected) else {
            return;
        };
        if conversation.remove(message_id) {
            let last = conversation.last_activity();
            inner.tracker.touch(&selected, last).await;
            let _ = self
                .events
                .send(ClientEvent::ConversationUpdated { peer_id: selected });
        }
    }

    /// Sends to the selected peer. The created message is not appended
    /// locally: the server echoes it over the realtime channel and dedup
    /// makes that echo idempotent.
    pub async fn send_message(&self, text: &str) -> Result<Message> {
        let receiver = self
            .inner
            .lock()
            .await
            .selected
            .clone()
            .ok_or(ClientError::NoSelection)?;
        let response = self
            .http
            .post(self.url("/api/messages"))
            .bearer_auth(&self.bearer_token)
            .json(&SendMessageRequest {
                receiver_id: receiver,
                text: text.to_string(),
            })
            .send()
            .await?;
        let created: MessagePayload = error::check_status(response).await?.json().await?;
        Ok(Message::from(created))
    }

    /// Issues the remote delete; local removal only happens after the server
    /// accepts it (no optimistic removal).
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<()> {
        let selected = self
            .inner
            .lock()
            .await
            .selected
            .clone()
            .ok_or(ClientError::NoSelection)?;
        let response = self
            .http
            .delete(self.url(&format!("/api/messages/{message_id}")))
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;
        error::check_status(response).await?;

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if let Some(conversation) = inner.conversations.get_mut(&selected) {
            conversation.remove(message_id);
            let last = conversation.last_activity();
            inner.tracker.touch(&selected, last).await;
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { peer_id: selected });
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
