//! Server-to-client events.
//!
//! [`Inbound::from_envelope`] dispatches on the action string and decodes the
//! payload for that action. Fields the client does not need are ignored, and
//! optional fields tolerate absence so that older or newer servers remain
//! compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    action,
    envelope::Envelope,
    errors::{ProtocolError, Result},
    model::{Conversation, ConversationId, Message, MessageId, Reactions, UserId, UserPublic},
};

/// `message:receive` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    /// Authoritative server copy
    pub message: Message,
    /// Echoed temp id when this acknowledges one of our sends
    #[serde(default)]
    pub temp_id: Option<MessageId>,
}

/// `message:typing` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    /// Conversation being typed in
    pub conversation_id: ConversationId,
    /// Typing user
    pub user_id: UserId,
    /// Started (true) or stopped (false)
    pub is_typing: bool,
}

/// `message:reaction` payload. Carries the full reaction map after the toggle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionUpdate {
    /// Conversation containing the message
    pub conversation_id: ConversationId,
    /// Message reacted to
    pub message_id: MessageId,
    /// `createdAt` of the message
    #[serde(default)]
    pub message_timestamp: Option<DateTime<Utc>>,
    /// Complete reaction map
    #[serde(default)]
    pub reactions: Reactions,
    /// User who toggled
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Emoji toggled
    #[serde(default)]
    pub emoji: Option<String>,
}

/// `message:deleted` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    /// Conversation containing the message
    pub conversation_id: ConversationId,
    /// Deleted message
    pub message_id: MessageId,
    /// User who deleted it
    pub deleted_by: UserId,
    /// Deletion time
    pub deleted_at: DateTime<Utc>,
    /// Tombstone for everyone (true) or hide locally (false)
    #[serde(default)]
    pub for_everyone: bool,
}

/// `conversation:created` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    /// The new conversation
    pub conversation: Conversation,
    /// Creator
    #[serde(default)]
    pub created_by: Option<UserId>,
}

/// `conversation:participants:added` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsAdded {
    /// Conversation gaining members
    pub conversation_id: ConversationId,
    /// Newly added user ids
    pub added_user_ids: Vec<UserId>,
    /// User who added them
    #[serde(default)]
    pub added_by: Option<UserId>,
    /// Profiles of the added users (or of all members, depending on server)
    #[serde(default)]
    pub participants: Vec<UserPublic>,
}

/// `conversation:participants:removed` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsRemoved {
    /// Conversation losing members
    pub conversation_id: ConversationId,
    /// Removed user ids
    pub removed_user_ids: Vec<UserId>,
    /// User who removed them
    #[serde(default)]
    pub removed_by: Option<UserId>,
}

/// `error` payload.
///
/// `code` is kept as raw JSON because servers send both strings and numbers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerError {
    /// Error code
    #[serde(default)]
    pub code: Value,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl ServerError {
    /// Whether the server rejected our credentials.
    pub fn is_unauthorized(&self) -> bool {
        match &self.code {
            Value::String(code) => {
                let code = code.to_ascii_lowercase();
                code == "unauthorized" || code == "auth_failed" || code == "401"
            },
            Value::Number(n) => n.as_u64() == Some(401),
            _ => false,
        }
    }

    /// Error code as text: strings verbatim, other JSON rendered, empty if
    /// absent.
    pub fn code_text(&self) -> String {
        match &self.code {
            Value::String(code) => code.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Typed inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// `message:receive`
    MessageReceived(MessageReceived),
    /// `message:typing`
    Typing(TypingEvent),
    /// `message:reaction`
    Reaction(ReactionUpdate),
    /// `message:deleted`
    Deleted(MessageDeleted),
    /// `conversation:created`
    ConversationCreated(ConversationCreated),
    /// `conversation:participants:added`
    ParticipantsAdded(ParticipantsAdded),
    /// `conversation:participants:removed`
    ParticipantsRemoved(ParticipantsRemoved),
    /// `error`
    Error(ServerError),
}

impl Inbound {
    /// Decode the payload selected by the envelope's action.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownAction` for unrecognized action strings
    /// - `ProtocolError::InvalidPayload` if `data` does not match the action
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let (name, data) = envelope.into_parts();

        match name.as_str() {
            action::MESSAGE_RECEIVE => payload(&name, data).map(Self::MessageReceived),
            action::MESSAGE_TYPING => payload(&name, data).map(Self::Typing),
            action::MESSAGE_REACTION => payload(&name, data).map(Self::Reaction),
            action::MESSAGE_DELETED => payload(&name, data).map(Self::Deleted),
            action::CONVERSATION_CREATED => payload(&name, data).map(Self::ConversationCreated),
            action::PARTICIPANTS_ADDED => payload(&name, data).map(Self::ParticipantsAdded),
            action::PARTICIPANTS_REMOVED => payload(&name, data).map(Self::ParticipantsRemoved),
            action::ERROR => payload(&name, data).map(Self::Error),
            _ => Err(ProtocolError::UnknownAction(name)),
        }
    }

    /// Decode a text frame straight to an event.
    ///
    /// # Errors
    ///
    /// Any error from [`Envelope::decode`] or [`Inbound::from_envelope`].
    pub fn decode_frame(text: &str) -> Result<Self> {
        Self::from_envelope(Envelope::decode(text)?)
    }

    /// Action string this event was decoded from.
    pub fn action(&self) -> &'static str {
        match self {
            Self::MessageReceived(_) => action::MESSAGE_RECEIVE,
            Self::Typing(_) => action::MESSAGE_TYPING,
            Self::Reaction(_) => action::MESSAGE_REACTION,
            Self::Deleted(_) => action::MESSAGE_DELETED,
            Self::ConversationCreated(_) => action::CONVERSATION_CREATED,
            Self::ParticipantsAdded(_) => action::PARTICIPANTS_ADDED,
            Self::ParticipantsRemoved(_) => action::PARTICIPANTS_REMOVED,
            Self::Error(_) => action::ERROR,
        }
    }
}

fn payload<T: DeserializeOwned>(action: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        action: action.to_string(),
        reason: e.to_string(),
    })
}
