//! REST history seam.
//!
//! Initial page loads come from an HTTP API outside this crate. Results are
//! merged into the cache with the same upsert-by-id rule as live events, via
//! [`crate::SyncClient::sync_history`].

use async_trait::async_trait;
use parley_proto::{Conversation, Message};
use parley_sync::Cursor;
use thiserror::Error;

/// History request failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HistoryError {
    /// Request did not complete
    #[error("request failed: {0}")]
    Request(String),

    /// Credentials were rejected
    #[error("unauthorized")]
    Unauthorized,
}

/// Conversation and message history provider.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Conversations of the signed-in user.
    async fn get_conversations(&self) -> Result<Vec<Conversation>, HistoryError>;

    /// A page of messages, newest page first: with `before`, the page
    /// immediately older than that cursor.
    async fn get_messages(
        &self,
        conversation_id: &str,
        before: Option<&Cursor>,
    ) -> Result<Vec<Message>, HistoryError>;
}
