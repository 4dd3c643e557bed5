//! In-memory chat server model.
//!
//! Speaks the same envelope protocol as the real server, closely enough for
//! end-to-end simulation: it assigns `srv-N` ids, echoes sends back with the
//! client's `tempId`, and records every frame it receives so tests can
//! assert on what actually went over the wire.
//!
//! Sends are idempotent by `tempId`: a retransmitted send is echoed with the
//! message stored the first time instead of creating a second one.

use std::collections::{BTreeMap, BTreeSet};

use parley_core::Environment;
use parley_proto::{
    ConversationId, Envelope, Message, MessageId, MessageKind, MessageStatus, Reactions, UserId,
    action,
    outbound::{ConversationRef, SendMessage},
};
use serde_json::{Value, json};

use crate::SimEnv;

/// Token query parameter the server checks.
const TOKEN_PARAM: &str = "token=";

/// Simulated chat server for a single client connection.
pub struct SimServer {
    env: SimEnv,
    local_user: UserId,
    next_id: u64,
    valid_tokens: BTreeSet<String>,
    messages: BTreeMap<ConversationId, Vec<Message>>,
    by_temp_id: BTreeMap<MessageId, (ConversationId, MessageId)>,
    joined: BTreeSet<ConversationId>,
    received: Vec<Envelope>,
    echo_sends: bool,
}

impl SimServer {
    /// Server for `local_user`'s connection, accepting any token.
    pub fn new(env: SimEnv, local_user: impl Into<UserId>) -> Self {
        Self {
            env,
            local_user: local_user.into(),
            next_id: 1,
            valid_tokens: BTreeSet::new(),
            messages: BTreeMap::new(),
            by_temp_id: BTreeMap::new(),
            joined: BTreeSet::new(),
            received: Vec::new(),
            echo_sends: true,
        }
    }

    /// Accept only `token` (call repeatedly to allow several).
    pub fn require_token(&mut self, token: &str) {
        self.valid_tokens.insert(token.to_string());
    }

    /// Stop (or resume) echoing sends. Stored messages are still created.
    pub fn set_echo(&mut self, echo: bool) {
        self.echo_sends = echo;
    }

    /// Whether a connection to `url` passes the token check.
    pub fn accepts(&self, url: &str) -> bool {
        if self.valid_tokens.is_empty() {
            return true;
        }
        url.split(['?', '&'])
            .filter_map(|part| part.strip_prefix(TOKEN_PARAM))
            .any(|token| self.valid_tokens.contains(token))
    }

    /// A new connection was accepted; subscriptions start empty.
    pub fn connection_opened(&mut self) {
        self.joined.clear();
    }

    /// Handle one client frame, returning the frames to push back.
    pub fn handle_frame(&mut self, text: &str) -> Vec<String> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%error, "server received undecodable frame");
                return Vec::new();
            },
        };
        self.received.push(envelope.clone());

        let (name, data) = envelope.into_parts();
        match name.as_str() {
            action::MESSAGE_SEND => match serde_json::from_value::<SendMessage>(data) {
                Ok(send) => self.handle_send(send),
                Err(error) => vec![error_frame("bad_request", &error.to_string())],
            },
            action::CONVERSATION_JOIN | action::CONVERSATION_LEAVE => {
                match serde_json::from_value::<ConversationRef>(data) {
                    Ok(target) if name == action::CONVERSATION_JOIN => {
                        self.joined.insert(target.conversation_id);
                        Vec::new()
                    },
                    Ok(target) => {
                        self.joined.remove(&target.conversation_id);
                        Vec::new()
                    },
                    Err(error) => vec![error_frame("bad_request", &error.to_string())],
                }
            },
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, send: SendMessage) -> Vec<String> {
        let existing = send.temp_id.as_ref().and_then(|temp_id| self.by_temp_id.get(temp_id)).cloned();
        let message = match existing.and_then(|(c, id)| self.find(&c, &id).cloned()) {
            Some(message) => {
                tracing::debug!(id = %message.id, "duplicate send, echoing stored copy");
                message
            },
            None => {
                let message = Message {
                    id: format!("srv-{}", self.next_id),
                    conversation_id: send.conversation_id.clone(),
                    sender_id: self.local_user.clone(),
                    original_content: send.content,
                    original_language: None,
                    translated_content: None,
                    target_language: None,
                    kind: send.kind,
                    status: MessageStatus::Sent,
                    created_at: self.env.wall_clock(),
                    reactions: Reactions::new(),
                    attachment: send.attachment,
                    reply_to: None,
                    deleted_at: None,
                    deleted_by: None,
                };
                self.next_id += 1;
                if let Some(temp_id) = &send.temp_id {
                    self.by_temp_id.insert(temp_id.clone(), (send.conversation_id.clone(), message.id.clone()));
                }
                self.messages.entry(send.conversation_id).or_default().push(message.clone());
                message
            },
        };

        if !self.echo_sends {
            return Vec::new();
        }
        vec![receive_frame(&message, send.temp_id.as_deref())]
    }

    /// Store a message from another user and return its `message:receive`
    /// frame.
    pub fn post_from(&mut self, sender_id: &str, conversation_id: &str, content: &str) -> String {
        let message = Message {
            id: format!("srv-{}", self.next_id),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            original_content: content.to_string(),
            original_language: None,
            translated_content: None,
            target_language: None,
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            created_at: self.env.wall_clock(),
            reactions: Reactions::new(),
            attachment: None,
            reply_to: None,
            deleted_at: None,
            deleted_by: None,
        };
        self.next_id += 1;
        self.messages.entry(conversation_id.to_string()).or_default().push(message.clone());
        receive_frame(&message, None)
    }

    /// Every frame received, in order
    pub fn received(&self) -> &[Envelope] {
        &self.received
    }

    /// Action strings of every frame received, in order
    pub fn actions(&self) -> Vec<&str> {
        self.received.iter().map(Envelope::action).collect()
    }

    /// How many `message:send` frames carried `temp_id`.
    pub fn sends_of(&self, temp_id: &str) -> usize {
        self.received
            .iter()
            .filter(|e| e.action() == action::MESSAGE_SEND && e.data_str("tempId") == Some(temp_id))
            .count()
    }

    /// Messages stored for a conversation
    pub fn stored(&self, conversation_id: &str) -> &[Message] {
        self.messages.get(conversation_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Temp ids the server has accepted
    pub fn acknowledged(&self) -> BTreeSet<MessageId> {
        self.by_temp_id.keys().cloned().collect()
    }

    /// Conversations subscribed on the current connection
    pub fn joined(&self) -> &BTreeSet<ConversationId> {
        &self.joined
    }

    fn find(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        self.messages.get(conversation_id)?.iter().find(|m| m.id == message_id)
    }
}

fn receive_frame(message: &Message, temp_id: Option<&str>) -> String {
    let mut data = json!({ "message": message });
    if let Some(temp_id) = temp_id {
        data["tempId"] = Value::from(temp_id);
    }
    encode(&Envelope::new(action::MESSAGE_RECEIVE, data))
}

/// `message:typing` frame for another user.
pub fn typing_frame(user_id: &str, conversation_id: &str, is_typing: bool) -> String {
    encode(&Envelope::new(
        action::MESSAGE_TYPING,
        json!({ "conversationId": conversation_id, "userId": user_id, "isTyping": is_typing }),
    ))
}

/// `error` frame.
pub fn error_frame(code: &str, message: &str) -> String {
    encode(&Envelope::new(action::ERROR, json!({ "code": code, "message": message })))
}

fn encode(envelope: &Envelope) -> String {
    envelope.encode().unwrap_or_else(|error| {
        tracing::warn!(%error, "server failed to encode frame");
        String::new()
    })
}
