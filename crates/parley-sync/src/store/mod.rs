//! Local message cache
//!
//! Trait-based abstraction over the on-device store. The trait is synchronous:
//! every operation is a short local transaction, and the engine calls it from
//! its own task.
//!
//! Each conversation keeps at most `capacity` messages (default
//! [`MESSAGE_CACHE_CAP`]). Inserting past the cap evicts the oldest messages
//! by `(createdAt, id)` in the same transaction as the insert. Every backend
//! orders `createdAt` at microsecond precision, so messages within the same
//! microsecond fall back to id order.

mod chaotic;
mod error;
mod memory;
mod redb;

use chrono::{DateTime, Utc};
pub use chaotic::ChaoticStore;
pub use error::StorageError;
pub use memory::MemoryStore;
use parley_proto::{Conversation, Message, MessageId};

pub use self::redb::RedbStore;

/// Messages kept per conversation.
pub const MESSAGE_CACHE_CAP: usize = 100;

/// Position in a conversation's `(createdAt, id)` order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    /// Creation time of the message at the cursor
    pub created_at: DateTime<Utc>,
    /// Id of the message at the cursor, breaking timestamp ties
    pub id: MessageId,
}

impl Cursor {
    /// Cursor at `message`
    pub fn of(message: &Message) -> Self {
        Self { created_at: message.created_at, id: message.id.clone() }
    }
}

/// Bounded local cache of conversations and messages.
///
/// Must be Clone (shared by the engine and tests), Send + Sync, and
/// synchronous. Implementations share internal state via Arc, so clones see
/// the same data. Every write is atomic per message.
pub trait MessageStore: Clone + Send + Sync + 'static {
    /// Insert or overwrite a message by `(conversationId, id)`, evicting the
    /// oldest messages past the cap.
    fn upsert_message(&self, message: &Message) -> Result<(), StorageError>;

    /// Replace `old_id` (usually a temp id) with `message` in one write.
    fn replace_message(
        &self,
        conversation_id: &str,
        old_id: &str,
        message: &Message,
    ) -> Result<(), StorageError>;

    /// Remove a message. Returns whether it existed.
    fn remove_message(&self, conversation_id: &str, message_id: &str)
    -> Result<bool, StorageError>;

    /// Up to `limit` messages strictly after `after` (from the oldest when
    /// `None`), ascending.
    fn load_messages(
        &self,
        conversation_id: &str,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;

    /// Up to `limit` messages strictly before `before`, nearest first in the
    /// scan but returned ascending.
    fn load_older(
        &self,
        conversation_id: &str,
        before: &Cursor,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError>;

    /// Number of cached messages in a conversation.
    fn message_count(&self, conversation_id: &str) -> Result<usize, StorageError>;

    /// Insert or overwrite a conversation.
    fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StorageError>;

    /// Remove a conversation and its cached messages.
    fn remove_conversation(&self, conversation_id: &str) -> Result<(), StorageError>;

    /// All cached conversations, descending by `updatedAt`.
    fn load_conversations(&self) -> Result<Vec<Conversation>, StorageError>;
}

/// Sort conversations for [`MessageStore::load_conversations`].
pub(crate) fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}

/// `createdAt` at the precision every backend orders by.
pub(crate) fn order_micros(created_at: DateTime<Utc>) -> i64 {
    created_at.timestamp_micros()
}
