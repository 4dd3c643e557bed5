//! Redb-backed durable message cache.
//!
//! Uses Redb's ACID transactions, so a crash never leaves a message without
//! its order entry or an eviction half done. Values are CBOR-encoded.

use std::{fmt::Display, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use parley_proto::{Conversation, Message};
use redb::{Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition};

use super::{Cursor, MESSAGE_CACHE_CAP, MessageStore, StorageError, order_micros, sort_conversations};

/// Table: messages
/// Key: conversation prefix + message id bytes
/// Value: CBOR-encoded Message
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: message_order
/// Key: conversation prefix + createdAt (8 bytes, order-preserving) + message
/// id bytes
/// Value: empty
const MESSAGE_ORDER: TableDefinition<&[u8], &[u8]> = TableDefinition::new("message_order");

/// Table: conversations
/// Key: conversation id bytes
/// Value: CBOR-encoded Conversation
const CONVERSATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("conversations");

/// Durable store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    capacity: usize,
}

impl RedbStore {
    /// Open or create a database at `path` with the default cap.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_capacity(path, MESSAGE_CACHE_CAP)
    }

    /// Open or create a database keeping `capacity` messages per
    /// conversation.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open_with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io)?;
            let _ = txn.open_table(MESSAGE_ORDER).map_err(io)?;
            let _ = txn.open_table(CONVERSATIONS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db), capacity })
    }
}

impl MessageStore for RedbStore {
    fn upsert_message(&self, message: &Message) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;
            let mut order = txn.open_table(MESSAGE_ORDER).map_err(io)?;

            write_message(&mut messages, &mut order, message)?;
            evict(&mut messages, &mut order, &message.conversation_id, self.capacity)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn replace_message(
        &self,
        conversation_id: &str,
        old_id: &str,
        message: &Message,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;
            let mut order = txn.open_table(MESSAGE_ORDER).map_err(io)?;

            delete_message(&mut messages, &mut order, conversation_id, old_id)?;
            write_message(&mut messages, &mut order, message)?;
            evict(&mut messages, &mut order, conversation_id, self.capacity)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn remove_message(&self, conversation_id: &str, message_id: &str) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        let existed = {
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;
            let mut order = txn.open_table(MESSAGE_ORDER).map_err(io)?;

            delete_message(&mut messages, &mut order, conversation_id, message_id)?
        };
        txn.commit().map_err(io)?;

        Ok(existed)
    }

    fn load_messages(
        &self,
        conversation_id: &str,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let messages = txn.open_table(MESSAGES).map_err(io)?;
        let order = txn.open_table(MESSAGE_ORDER).map_err(io)?;

        let prefix = conversation_prefix(conversation_id)?;
        let after_key = after.map(|c| order_key(conversation_id, c.created_at, &c.id)).transpose()?;

        let mut loaded = Vec::with_capacity(limit.min(MESSAGE_CACHE_CAP));
        for result in order.range(prefix.as_slice()..).map_err(io)? {
            if loaded.len() >= limit {
                break;
            }

            let (key, _) = result.map_err(io)?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                break;
            }
            if after_key.as_deref().is_some_and(|after| key <= after) {
                continue;
            }

            let id = &key[prefix.len() + 8..];
            if let Some(message) = read_message(&messages, &prefix, id)? {
                loaded.push(message);
            }
        }

        Ok(loaded)
    }

    fn load_older(
        &self,
        conversation_id: &str,
        before: &Cursor,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let messages = txn.open_table(MESSAGES).map_err(io)?;
        let order = txn.open_table(MESSAGE_ORDER).map_err(io)?;

        let prefix = conversation_prefix(conversation_id)?;
        let before_key = order_key(conversation_id, before.created_at, &before.id)?;

        let mut loaded = Vec::with_capacity(limit.min(MESSAGE_CACHE_CAP));
        for result in order.range(prefix.as_slice()..before_key.as_slice()).map_err(io)?.rev() {
            if loaded.len() >= limit {
                break;
            }

            let (key, _) = result.map_err(io)?;
            let key = key.value();
            let id = &key[prefix.len() + 8..];
            if let Some(message) = read_message(&messages, &prefix, id)? {
                loaded.push(message);
            }
        }

        loaded.reverse();
        Ok(loaded)
    }

    fn message_count(&self, conversation_id: &str) -> Result<usize, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let order = txn.open_table(MESSAGE_ORDER).map_err(io)?;

        let prefix = conversation_prefix(conversation_id)?;
        let mut count = 0;
        for result in order.range(prefix.as_slice()..).map_err(io)? {
            let (key, _) = result.map_err(io)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }

        Ok(count)
    }

    fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(CONVERSATIONS).map_err(io)?;

            let mut bytes = Vec::new();
            ciborium::into_writer(conversation, &mut bytes).map_err(serialization)?;

            table.insert(conversation.id.as_bytes(), bytes.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn remove_conversation(&self, conversation_id: &str) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut conversations = txn.open_table(CONVERSATIONS).map_err(io)?;
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;
            let mut order = txn.open_table(MESSAGE_ORDER).map_err(io)?;

            conversations.remove(conversation_id.as_bytes()).map_err(io)?;

            let prefix = conversation_prefix(conversation_id)?;
            let keys = prefixed_keys(&order, &prefix, usize::MAX)?;
            for key in keys {
                order.remove(key.as_slice()).map_err(io)?;
                let mut message_key = prefix.clone();
                message_key.extend_from_slice(&key[prefix.len() + 8..]);
                messages.remove(message_key.as_slice()).map_err(io)?;
            }
        }
        txn.commit().map_err(io)?;

        Ok(())
    }

    fn load_conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(CONVERSATIONS).map_err(io)?;

        let mut conversations = Vec::with_capacity(usize::try_from(table.len().map_err(io)?).unwrap_or(0));
        for result in table.iter().map_err(io)? {
            let (_, value) = result.map_err(io)?;
            let conversation: Conversation =
                ciborium::from_reader(value.value()).map_err(serialization)?;
            conversations.push(conversation);
        }

        sort_conversations(&mut conversations);
        Ok(conversations)
    }
}

type BytesTable<'txn> = Table<'txn, &'static [u8], &'static [u8]>;

fn write_message(
    messages: &mut BytesTable<'_>,
    order: &mut BytesTable<'_>,
    message: &Message,
) -> Result<(), StorageError> {
    let prefix = conversation_prefix(&message.conversation_id)?;
    let key = message_key(&prefix, &message.id);

    // An upsert may move the message in the order (edited createdAt)
    if let Some(previous) = read_message(messages, &prefix, message.id.as_bytes())? {
        let old_order = order_key(&previous.conversation_id, previous.created_at, &previous.id)?;
        order.remove(old_order.as_slice()).map_err(io)?;
    }

    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes).map_err(serialization)?;

    messages.insert(key.as_slice(), bytes.as_slice()).map_err(io)?;
    let new_order = order_key(&message.conversation_id, message.created_at, &message.id)?;
    let empty: &[u8] = &[];
    order.insert(new_order.as_slice(), empty).map_err(io)?;

    Ok(())
}

fn delete_message(
    messages: &mut BytesTable<'_>,
    order: &mut BytesTable<'_>,
    conversation_id: &str,
    message_id: &str,
) -> Result<bool, StorageError> {
    let prefix = conversation_prefix(conversation_id)?;
    let Some(previous) = read_message(messages, &prefix, message_id.as_bytes())? else {
        return Ok(false);
    };

    messages.remove(message_key(&prefix, message_id).as_slice()).map_err(io)?;
    let old_order = order_key(conversation_id, previous.created_at, message_id)?;
    order.remove(old_order.as_slice()).map_err(io)?;

    Ok(true)
}

/// Delete the oldest messages beyond `capacity`.
///
/// Keys are collected first so the range iterator is released before the
/// removals.
fn evict(
    messages: &mut BytesTable<'_>,
    order: &mut BytesTable<'_>,
    conversation_id: &str,
    capacity: usize,
) -> Result<(), StorageError> {
    let prefix = conversation_prefix(conversation_id)?;
    let keys = prefixed_keys(order, &prefix, usize::MAX)?;
    if keys.len() <= capacity {
        return Ok(());
    }

    let excess = keys.len() - capacity;
    tracing::debug!(%conversation_id, excess, "evicting cached messages");

    for key in keys.into_iter().take(excess) {
        order.remove(key.as_slice()).map_err(io)?;
        let mut message_key = prefix.clone();
        message_key.extend_from_slice(&key[prefix.len() + 8..]);
        messages.remove(message_key.as_slice()).map_err(io)?;
    }

    Ok(())
}

fn prefixed_keys<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
    limit: usize,
) -> Result<Vec<Vec<u8>>, StorageError> {
    let mut keys = Vec::new();
    for result in table.range(prefix..).map_err(io)? {
        if keys.len() >= limit {
            break;
        }
        let (key, _) = result.map_err(io)?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_vec());
    }
    Ok(keys)
}

fn read_message<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
    id: &[u8],
) -> Result<Option<Message>, StorageError> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(id);

    match table.get(key.as_slice()).map_err(io)? {
        Some(value) => {
            let message = ciborium::from_reader(value.value()).map_err(serialization)?;
            Ok(Some(message))
        },
        None => Ok(None),
    }
}

/// Length-prefixed conversation id, so one id is never a prefix of another's
/// keys.
///
/// # Errors
///
/// - `StorageError::KeyTooLong` if the id does not fit the `u16` length
fn conversation_prefix(conversation_id: &str) -> Result<Vec<u8>, StorageError> {
    let bytes = conversation_id.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| StorageError::KeyTooLong { len: bytes.len(), max: usize::from(u16::MAX) })?;
    let mut prefix = Vec::with_capacity(2 + bytes.len());
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(bytes);
    Ok(prefix)
}

fn message_key(prefix: &[u8], message_id: &str) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(message_id.as_bytes());
    key
}

/// Order key: prefix, then `createdAt` micros with the sign bit flipped so
/// big-endian byte order matches numeric order, then the id.
fn order_key(conversation_id: &str, created_at: DateTime<Utc>, message_id: &str) -> Result<Vec<u8>, StorageError> {
    let mut key = conversation_prefix(conversation_id)?;
    let micros = order_micros(created_at);
    let sortable = u64::from_be_bytes(micros.to_be_bytes()) ^ (1 << 63);
    key.extend_from_slice(&sortable.to_be_bytes());
    key.extend_from_slice(message_id.as_bytes());
    Ok(key)
}

fn io(e: impl Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn serialization(e: impl Display) -> StorageError {
    StorageError::Serialization(e.to_string())
}
