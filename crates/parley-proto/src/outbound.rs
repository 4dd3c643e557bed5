//! Client-to-server actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    action,
    envelope::Envelope,
    errors::{ProtocolError, Result},
    model::{Attachment, ConversationId, MessageId, MessageKind},
};

/// `message:send` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Message text (or caption for attachments)
    pub content: String,
    /// Content type
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Temp id of the optimistic copy, echoed back by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
    /// Previously uploaded blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Ask the server to translate the attached document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translate_document: Option<bool>,
    /// Id of the message being replied to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
}

/// `message:typing` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    /// Conversation being typed in
    pub conversation_id: ConversationId,
    /// Whether the user is currently typing
    pub is_typing: bool,
}

/// `message:read` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    /// Conversation containing the message
    pub conversation_id: ConversationId,
    /// Newest message the user has seen
    pub message_id: MessageId,
}

/// `message:reaction` payload. The server toggles the reaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionToggle {
    /// Conversation containing the message
    pub conversation_id: ConversationId,
    /// Message reacted to
    pub message_id: MessageId,
    /// `createdAt` of the message, used by the server as a sort key
    pub message_timestamp: DateTime<Utc>,
    /// Emoji to toggle
    pub emoji: String,
}

/// `conversation:join` / `conversation:leave` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    /// Conversation to (un)subscribe
    pub conversation_id: ConversationId,
}

/// Typed outbound action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// `message:send`
    SendMessage(SendMessage),
    /// `message:typing`
    Typing(TypingNotice),
    /// `message:read`
    Read(ReadReceipt),
    /// `message:reaction`
    Reaction(ReactionToggle),
    /// `conversation:join`
    Join(ConversationRef),
    /// `conversation:leave`
    Leave(ConversationRef),
}

impl Outbound {
    /// Action string for this payload.
    pub fn action(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => action::MESSAGE_SEND,
            Self::Typing(_) => action::MESSAGE_TYPING,
            Self::Read(_) => action::MESSAGE_READ,
            Self::Reaction(_) => action::MESSAGE_REACTION,
            Self::Join(_) => action::CONVERSATION_JOIN,
            Self::Leave(_) => action::CONVERSATION_LEAVE,
        }
    }

    /// Conversation this action targets.
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::SendMessage(p) => &p.conversation_id,
            Self::Typing(p) => &p.conversation_id,
            Self::Read(p) => &p.conversation_id,
            Self::Reaction(p) => &p.conversation_id,
            Self::Join(p) | Self::Leave(p) => &p.conversation_id,
        }
    }

    /// Whether the action is worth holding in the offline queue.
    ///
    /// Typing indicators are stale by the time a connection returns, and
    /// joins are re-issued on every connect anyway.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Typing(_) | Self::Join(_))
    }

    /// Wrap the payload in an envelope.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::JsonEncode` if the payload cannot be represented as
    ///   JSON
    pub fn into_envelope(self) -> Result<Envelope> {
        let action = self.action();
        let data = match self {
            Self::SendMessage(p) => serde_json::to_value(p),
            Self::Typing(p) => serde_json::to_value(p),
            Self::Read(p) => serde_json::to_value(p),
            Self::Reaction(p) => serde_json::to_value(p),
            Self::Join(p) | Self::Leave(p) => serde_json::to_value(p),
        }
        .map_err(|e| ProtocolError::JsonEncode(e.to_string()))?;

        Ok(Envelope::new(action, data))
    }
}
