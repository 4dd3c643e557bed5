//! In-memory store for tests and for running without a cache file.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use parley_proto::{Conversation, ConversationId, Message, MessageId};

use super::{Cursor, MESSAGE_CACHE_CAP, MessageStore, StorageError, order_micros, sort_conversations};

/// `(createdAt micros, id)`
type OrderKey = (i64, MessageId);

/// One conversation's cached messages.
#[derive(Default)]
struct Bucket {
    /// Messages in `(createdAt, id)` order
    ordered: BTreeMap<OrderKey, Message>,
    /// id -> createdAt micros, to find a message's order key
    created: HashMap<MessageId, i64>,
}

impl Bucket {
    fn insert(&mut self, message: &Message) {
        let micros = order_micros(message.created_at);
        if let Some(previous) = self.created.insert(message.id.clone(), micros) {
            self.ordered.remove(&(previous, message.id.clone()));
        }
        self.ordered.insert((micros, message.id.clone()), message.clone());
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.created.remove(id) {
            Some(micros) => {
                self.ordered.remove(&(micros, id.to_string()));
                true
            },
            None => false,
        }
    }

    fn evict(&mut self, capacity: usize) {
        while self.ordered.len() > capacity {
            let Some(((_, id), _)) = self.ordered.pop_first() else {
                break;
            };
            self.created.remove(&id);
        }
    }
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<ConversationId, Bucket>,
    conversations: HashMap<ConversationId, Conversation>,
}

/// In-memory [`MessageStore`].
///
/// All state sits behind one `Arc<Mutex<_>>`, so every operation is atomic
/// and clones share data. A poisoned lock is reported as
/// [`StorageError::Io`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store with the default cap
    pub fn new() -> Self {
        Self::with_capacity(MESSAGE_CACHE_CAP)
    }

    /// Empty store keeping `capacity` messages per conversation
    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), capacity }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("memory store lock poisoned".to_string()))
    }
}

impl MessageStore for MemoryStore {
    fn upsert_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let bucket = inner.buckets.entry(message.conversation_id.clone()).or_default();
        bucket.insert(message);
        bucket.evict(self.capacity);
        Ok(())
    }

    fn replace_message(
        &self,
        conversation_id: &str,
        old_id: &str,
        message: &Message,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let bucket = inner.buckets.entry(conversation_id.to_string()).or_default();
        bucket.remove(old_id);
        bucket.insert(message);
        bucket.evict(self.capacity);
        Ok(())
    }

    fn remove_message(&self, conversation_id: &str, message_id: &str) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        Ok(inner.buckets.get_mut(conversation_id).is_some_and(|bucket| bucket.remove(message_id)))
    }

    fn load_messages(
        &self,
        conversation_id: &str,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let inner = self.lock()?;
        let Some(bucket) = inner.buckets.get(conversation_id) else {
            return Ok(Vec::new());
        };

        let messages = bucket
            .ordered
            .iter()
            .filter(|((created_at, id), _)| {
                after.is_none_or(|c| (*created_at, id.as_str()) > (order_micros(c.created_at), c.id.as_str()))
            })
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect();
        Ok(messages)
    }

    fn load_older(
        &self,
        conversation_id: &str,
        before: &Cursor,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let inner = self.lock()?;
        let Some(bucket) = inner.buckets.get(conversation_id) else {
            return Ok(Vec::new());
        };

        let mut messages: Vec<Message> = bucket
            .ordered
            .iter()
            .rev()
            .filter(|((created_at, id), _)| {
                (*created_at, id.as_str()) < (order_micros(before.created_at), before.id.as_str())
            })
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect();
        messages.reverse();
        Ok(messages)
    }

    fn message_count(&self, conversation_id: &str) -> Result<usize, StorageError> {
        let inner = self.lock()?;
        Ok(inner.buckets.get(conversation_id).map_or(0, |bucket| bucket.ordered.len()))
    }

    fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn remove_conversation(&self, conversation_id: &str) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.conversations.remove(conversation_id);
        inner.buckets.remove(conversation_id);
        Ok(())
    }

    fn load_conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        let inner = self.lock()?;
        let mut conversations: Vec<Conversation> = inner.conversations.values().cloned().collect();
        sort_conversations(&mut conversations);
        Ok(conversations)
    }
}
