use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, UserId};

/// Friend entry as returned by the friends-list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    #[serde(rename = "_id")]
    pub user_id: UserId,
    pub name: String,
    #[serde(
        rename = "profilePic",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_url: Option<String>,
}

/// A user reference on the wire: either a bare id string or a populated
/// object, depending on which endpoint produced the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Id(UserId),
    Embedded(EmbeddedUser),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedUser {
    #[serde(rename = "_id")]
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UserRef {
    /// Single normalization point for sender/receiver identity extraction.
    pub fn id(&self) -> &UserId {
        match self {
            UserRef::Id(id) => id,
            UserRef::Embedded(user) => &user.user_id,
        }
    }

    pub fn into_id(self) -> UserId {
        match self {
            UserRef::Id(id) => id,
            UserRef::Embedded(user) => user.user_id,
        }
    }
}

impl From<UserId> for UserRef {
    fn from(id: UserId) -> Self {
        UserRef::Id(id)
    }
}

/// Message as carried by both the history endpoint and the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "_id")]
    pub message_id: MessageId,
    pub sender: UserRef,
    pub receiver: UserRef,
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub text: String,
}

/// Client-to-server frames on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    JoinRoom { user_id: UserId },
}

/// Server-to-client frames on the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage {
        message: MessagePayload,
    },
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: MessageId,
    },
}
