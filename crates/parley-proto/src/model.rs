//! Conversation and message data model.
//!
//! These are the shapes carried inside envelopes and persisted by the local
//! store. Field names follow the wire's camelCase convention.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation identifier (opaque, server-assigned).
pub type ConversationId = String;

/// Message identifier. Either a server id or a client temp id.
pub type MessageId = String;

/// User identifier (opaque, server-assigned).
pub type UserId = String;

/// Reaction map: emoji to the set of users who reacted with it.
pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

/// Prefix tagging client-assigned temporary message ids.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Build a temporary message id: `temp-<epochMillis>-<nonce>`.
pub fn temp_id(epoch_millis: i64, nonce: u32) -> MessageId {
    format!("{TEMP_ID_PREFIX}{epoch_millis}-{nonce:08x}")
}

/// Whether `id` was assigned client-side.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistic, not yet acknowledged
    Sending,
    /// Acknowledged by the server
    #[default]
    Sent,
    /// Delivered to at least one recipient device
    Delivered,
    /// Read by at least one recipient
    Seen,
    /// Permanent send failure; requires explicit user retry
    Failed,
}

/// Content type of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text
    #[default]
    Text,
    /// Image attachment
    Image,
    /// Generic file attachment
    File,
    /// Voice note or audio clip
    Audio,
    /// Video clip
    Video,
}

/// Uploaded blob referenced by a message.
///
/// Upload and download happen outside the sync engine; only the reference
/// travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Blob storage URL
    pub url: String,
    /// Original file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Quoted message preview attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTo {
    /// Id of the message being replied to
    pub message_id: MessageId,
    /// Sender of the quoted message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    /// Quoted content excerpt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server id, or temp id while optimistic
    pub id: MessageId,
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Author
    pub sender_id: UserId,
    /// Content as written by the sender
    pub original_content: String,
    /// Detected language of `original_content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_language: Option<String>,
    /// Server-provided translation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_content: Option<String>,
    /// Language of `translated_content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    /// Content type
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Delivery status; servers that omit it imply `sent`
    #[serde(default)]
    pub status: MessageStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Reactions by emoji
    #[serde(default)]
    pub reactions: Reactions,
    /// Attached blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Quoted message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
    /// Deletion time when deleted for everyone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// User who deleted the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<UserId>,
}

impl Message {
    /// Whether this message still carries a client-assigned temp id.
    pub fn is_optimistic(&self) -> bool {
        is_temp_id(&self.id)
    }

    /// Whether the message was deleted for everyone.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Public profile of a conversation participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublic {
    /// User id
    pub id: UserId,
    /// Login handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Language the user reads translations in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
}

impl UserPublic {
    /// Profile with only an id, used when the server sent ids without
    /// profiles.
    pub fn placeholder(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            username: None,
            display_name: None,
            avatar_url: None,
            preferred_language: None,
        }
    }
}

/// Conversation type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// One-to-one
    #[default]
    Direct,
    /// Multi-member
    Group,
}

/// A conversation and its list-view summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation id
    pub id: ConversationId,
    /// Direct or group
    #[serde(rename = "type", default)]
    pub kind: ConversationKind,
    /// Group name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Members in membership order, unique by id
    #[serde(default)]
    pub participants: Vec<UserPublic>,
    /// Newest message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last activity; drives list ordering (descending)
    pub updated_at: DateTime<Utc>,
    /// Messages from others not yet seen
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// Whether `user_id` is a member.
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }

    /// Append members not already present, keeping membership order.
    ///
    /// Returns true if any member was added.
    pub fn add_participants(&mut self, users: impl IntoIterator<Item = UserPublic>) -> bool {
        let before = self.participants.len();
        for user in users {
            if !self.has_participant(&user.id) {
                self.participants.push(user);
            }
        }
        self.participants.len() != before
    }

    /// Remove members by id. Returns true if any member was removed.
    pub fn remove_participants(&mut self, user_ids: &[UserId]) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| !user_ids.contains(&p.id));
        self.participants.len() != before
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn temp_ids_are_prefix_tagged() {
        let id = temp_id(1_700_000_000_000, 0xbeef);
        assert_eq!(id, "temp-1700000000000-0000beef");
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("srv-9"));
    }

    #[test]
    fn message_defaults_for_sparse_server_payload() {
        let message: Message = serde_json::from_value(json!({
            "id": "srv-1",
            "conversationId": "c1",
            "senderId": "u2",
            "originalContent": "hola",
            "createdAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.kind, MessageKind::Text);
        assert!(message.reactions.is_empty());
        assert!(!message.is_optimistic());
        assert!(!message.is_deleted());
    }

    #[test]
    fn reactions_decode_as_sets() {
        let message: Message = serde_json::from_value(json!({
            "id": "srv-1",
            "conversationId": "c1",
            "senderId": "u2",
            "originalContent": "hola",
            "createdAt": "2026-01-01T00:00:00Z",
            "reactions": { "👍": ["u1", "u3", "u1"] }
        }))
        .unwrap();

        assert_eq!(message.reactions["👍"].len(), 2);
    }

    #[test]
    fn participants_stay_unique_and_ordered() {
        let now = Utc::now();
        let mut conversation = Conversation {
            id: "c1".into(),
            kind: ConversationKind::Group,
            name: None,
            participants: vec![UserPublic::placeholder("a")],
            last_message: None,
            created_at: now,
            updated_at: now,
            unread_count: 0,
        };

        assert!(conversation.add_participants([
            UserPublic::placeholder("b"),
            UserPublic::placeholder("a"),
            UserPublic::placeholder("c"),
        ]));
        let ids: Vec<_> = conversation.participants.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        assert!(!conversation.add_participants([UserPublic::placeholder("b")]));
        assert!(conversation.remove_participants(&["b".into()]));
        assert!(!conversation.has_participant("b"));
    }
}
