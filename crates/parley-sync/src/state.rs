//! In-memory view of conversations, messages and typing sets.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use parley_proto::{Conversation, ConversationId, Message, MessageId, UserId};

/// A conversation's messages in display order, indexed by id.
///
/// Ids are unique: every insert path checks the index first. Updates are
/// applied in place so a replaced message keeps its position.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
}

impl MessageLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in display order
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Messages as a slice
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    /// Whether a message with `id` is present
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Position of `id`
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Message by id
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.position(id).and_then(|i| self.messages.get(i))
    }

    /// Mutable message by id. The id itself must not be changed through this
    /// reference; use [`MessageLog::replace_at`] for that.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        let i = self.position(id)?;
        self.messages.get_mut(i)
    }

    /// Message at `position`
    pub fn at(&self, position: usize) -> Option<&Message> {
        self.messages.get(position)
    }

    /// Message with the greatest `createdAt` (latest position on ties)
    pub fn newest(&self) -> Option<&Message> {
        self.messages.iter().max_by_key(|m| m.created_at)
    }

    /// Append at the end. Returns false if the id is already present.
    pub fn push(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
        true
    }

    /// Insert keeping `createdAt` order: after every message not newer than
    /// this one. Returns false if the id is already present.
    pub fn insert_sorted(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let at = self.messages.partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        self.reindex_from(at);
        true
    }

    /// Overwrite the message at `position`, which may change its id.
    ///
    /// Returns the previous message. Fails (returning `None`) if `position`
    /// is out of range or the new id already exists at another position.
    pub fn replace_at(&mut self, position: usize, message: Message) -> Option<Message> {
        if let Some(existing) = self.position(&message.id)
            && existing != position
        {
            return None;
        }
        let slot = self.messages.get_mut(position)?;
        let old = std::mem::replace(slot, message);
        self.index.remove(&old.id);
        self.index.insert(self.messages[position].id.clone(), position);
        Some(old)
    }

    /// Remove by id, preserving the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let at = self.index.remove(id)?;
        let message = self.messages.remove(at);
        self.reindex_from(at);
        Some(message)
    }

    /// Oldest optimistic message from `sender_id` with identical content,
    /// created within `window` of `now`.
    ///
    /// This is the fallback match for server echoes that lost their temp id.
    /// Two identical sends inside the window can be matched to the wrong
    /// copy; choosing the oldest keeps the result deterministic.
    pub fn find_recent_optimistic(
        &self,
        sender_id: &str,
        content: &str,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.is_optimistic()
                    && m.sender_id == sender_id
                    && m.original_content == content
                    && (now - m.created_at).abs() <= window
            })
            .min_by_key(|(i, m)| (m.created_at, *i))
            .map(|(i, _)| i)
    }

    fn reindex_from(&mut self, from: usize) {
        for (i, message) in self.messages.iter().enumerate().skip(from) {
            self.index.insert(message.id.clone(), i);
        }
    }
}

/// Conversations ordered by `updatedAt`, newest first.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    conversations: Vec<Conversation>,
}

impl ConversationList {
    /// Build from an unordered list
    pub fn from_unsorted(conversations: Vec<Conversation>) -> Self {
        let mut list = Self { conversations };
        list.sort();
        list
    }

    /// Conversations, newest first
    pub fn as_slice(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Number of conversations
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Conversation by id
    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// Mutable conversation by id. Call [`ConversationList::sort`] after
    /// changing `updated_at`.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    /// Insert or replace by id. Does not re-sort.
    pub fn upsert(&mut self, conversation: Conversation) {
        match self.get_mut(&conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
    }

    /// Remove by id
    pub fn remove(&mut self, id: &str) -> Option<Conversation> {
        let at = self.conversations.iter().position(|c| c.id == id)?;
        Some(self.conversations.remove(at))
    }

    /// Restore descending `updatedAt` order. Returns true if the order
    /// changed. Stable, so ties keep their relative order.
    pub fn sort(&mut self) -> bool {
        let before: Vec<ConversationId> = self.conversations.iter().map(|c| c.id.clone()).collect();
        self.conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.conversations.iter().map(|c| &c.id).ne(before.iter())
    }
}

/// Everything the reconciler reads and writes.
#[derive(Debug, Clone)]
pub struct SyncState {
    /// Signed-in user
    pub local_user_id: UserId,
    /// Conversation list, newest first
    pub conversations: ConversationList,
    /// Message logs by conversation
    pub messages: HashMap<ConversationId, MessageLog>,
    /// Users currently typing, by conversation. Never persisted.
    pub typing: HashMap<ConversationId, BTreeSet<UserId>>,
    /// Conversation on screen; its incoming messages do not count as unread
    pub active: Option<ConversationId>,
}

impl SyncState {
    /// Empty state for `local_user_id`
    pub fn new(local_user_id: impl Into<UserId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            conversations: ConversationList::default(),
            messages: HashMap::new(),
            typing: HashMap::new(),
            active: None,
        }
    }

    /// Message log for a conversation, if any messages are loaded
    pub fn log(&self, conversation_id: &str) -> Option<&MessageLog> {
        self.messages.get(conversation_id)
    }

    /// Message log for a conversation, created if absent
    pub fn log_mut(&mut self, conversation_id: &str) -> &mut MessageLog {
        self.messages.entry(conversation_id.to_string()).or_default()
    }

    /// Users typing in a conversation
    pub fn typing_in(&self, conversation_id: &str) -> BTreeSet<UserId> {
        self.typing.get(conversation_id).cloned().unwrap_or_default()
    }
}
