//! Async handle to the sync runtime.
//!
//! [`SyncClient`] is cheap to clone; every clone talks to the same runtime
//! task. Commands never wait on the network: they return once the engine has
//! taken them.

use parley_core::Environment;
use parley_proto::{
    Attachment, Conversation, ConversationId, MessageId, MessageKind, ReplyTo, model::temp_id,
};
use parley_sync::{Connectivity, EngineConfig, MessageDraft, MessageStore, SyncEngine, SyncUpdate};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    error::ClientError,
    history::HistoryApi,
    runtime::{ActiveMessages, Command, Observers, Reply, Runtime, TypingMap},
};

/// Handle to a running sync engine.
#[derive(Clone)]
pub struct SyncClient<E: Environment> {
    env: E,
    commands: mpsc::UnboundedSender<Command>,
    connectivity: watch::Receiver<Connectivity>,
    conversations: watch::Receiver<Vec<Conversation>>,
    messages: watch::Receiver<ActiveMessages>,
    typing: watch::Receiver<TypingMap>,
    updates: broadcast::Sender<SyncUpdate>,
}

impl<E: Environment> SyncClient<E> {
    /// Start the runtime task for `user_id` on the current Tokio runtime.
    ///
    /// Cached conversations are loaded from `store` before this returns.
    pub fn spawn<S: MessageStore>(
        env: E,
        store: S,
        user_id: impl Into<String>,
        config: EngineConfig,
    ) -> (Self, JoinHandle<()>) {
        let engine = SyncEngine::new(env.clone(), store, user_id.into(), config);
        let observers = Observers::new(engine.conversations().to_vec());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let client = Self {
            env: env.clone(),
            commands,
            connectivity: observers.connectivity.subscribe(),
            conversations: observers.conversations.subscribe(),
            messages: observers.messages.subscribe(),
            typing: observers.typing.subscribe(),
            updates: observers.updates.clone(),
        };

        let runtime = Runtime::new(env, engine, commands_rx, observers);
        let handle = tokio::spawn(runtime.run());
        (client, handle)
    }

    /// Start a session with `token`. Returns once the connect is underway;
    /// follow progress on [`SyncClient::connectivity`].
    pub async fn connect(&self, token: impl Into<String>) -> Result<(), ClientError> {
        let token = token.into();
        self.request(|reply| Command::Connect { token, reply }).await
    }

    /// Intentional logout. Queued sends are marked failed; no reconnect.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send(Command::Disconnect)
    }

    /// Send a message. Returns its temp id; the optimistic copy is in the
    /// view when this returns, before anything is sent.
    pub async fn send_message(
        &self,
        conversation_id: impl Into<ConversationId>,
        content: impl Into<String>,
        kind: MessageKind,
        attachment: Option<Attachment>,
        reply_to: Option<ReplyTo>,
    ) -> Result<MessageId, ClientError> {
        let draft = MessageDraft {
            conversation_id: conversation_id.into(),
            content: content.into(),
            kind,
            attachment,
            reply_to,
            translate_document: None,
        };
        self.send_draft(draft).await
    }

    /// Send a prepared draft. See [`SyncClient::send_message`].
    pub async fn send_draft(&self, draft: MessageDraft) -> Result<MessageId, ClientError> {
        let id = temp_id(self.env.wall_clock().timestamp_millis(), self.env.random_u32());
        let temp_id = id.clone();
        self.request(|reply| Command::SendMessage { draft, temp_id, reply }).await?;
        Ok(id)
    }

    /// Send a failed message again.
    pub async fn retry_message(
        &self,
        conversation_id: impl Into<ConversationId>,
        message_id: impl Into<MessageId>,
    ) -> Result<(), ClientError> {
        let conversation_id = conversation_id.into();
        let message_id = message_id.into();
        self.request(|reply| Command::Retry { conversation_id, message_id, reply }).await
    }

    /// Typing indicator; dropped while offline.
    pub fn set_typing(&self, conversation_id: impl Into<ConversationId>, is_typing: bool) -> Result<(), ClientError> {
        self.send(Command::SetTyping { conversation_id: conversation_id.into(), is_typing })
    }

    /// Toggle `emoji` on a message.
    pub async fn send_reaction(
        &self,
        conversation_id: impl Into<ConversationId>,
        message_id: impl Into<MessageId>,
        emoji: impl Into<String>,
    ) -> Result<(), ClientError> {
        let conversation_id = conversation_id.into();
        let message_id = message_id.into();
        let emoji = emoji.into();
        self.request(|reply| Command::SendReaction { conversation_id, message_id, emoji, reply }).await
    }

    /// Reset the unread count and send a read receipt.
    pub fn mark_read(&self, conversation_id: impl Into<ConversationId>) -> Result<(), ClientError> {
        self.send(Command::MarkRead { conversation_id: conversation_id.into() })
    }

    /// Open a conversation; it stays subscribed across reconnects.
    pub fn join_conversation(&self, conversation_id: impl Into<ConversationId>) -> Result<(), ClientError> {
        self.send(Command::Join { conversation_id: conversation_id.into() })
    }

    /// Close a conversation. Safe in any state.
    pub fn leave_conversation(&self, conversation_id: impl Into<ConversationId>) -> Result<(), ClientError> {
        self.send(Command::Leave { conversation_id: conversation_id.into() })
    }

    /// App came to the foreground or the network returned.
    pub fn ensure_connected(&self) -> Result<(), ClientError> {
        self.send(Command::EnsureConnected)
    }

    /// App went to the background; keepalive pauses.
    pub fn enter_background(&self) -> Result<(), ClientError> {
        self.send(Command::EnterBackground)
    }

    /// Merge a REST message page.
    pub fn merge_history(
        &self,
        conversation_id: impl Into<ConversationId>,
        page: Vec<parley_proto::Message>,
    ) -> Result<(), ClientError> {
        self.send(Command::MergeHistory { conversation_id: conversation_id.into(), page })
    }

    /// Merge a REST conversation list.
    pub fn merge_conversations(&self, conversations: Vec<Conversation>) -> Result<(), ClientError> {
        self.send(Command::MergeConversations { conversations })
    }

    /// Page up to `limit` older cached messages into the view.
    pub async fn load_older(
        &self,
        conversation_id: impl Into<ConversationId>,
        limit: usize,
    ) -> Result<(), ClientError> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::LoadOlder { conversation_id, limit, reply }).await
    }

    /// Fetch conversations (and the first message page of `conversation_id`)
    /// from `api` and merge them.
    pub async fn sync_history<H: HistoryApi + ?Sized>(
        &self,
        api: &H,
        conversation_id: Option<&str>,
    ) -> Result<(), ClientError> {
        let conversations = api.get_conversations().await?;
        tracing::debug!(count = conversations.len(), "fetched conversations");
        self.merge_conversations(conversations)?;

        if let Some(conversation_id) = conversation_id {
            let page = api.get_messages(conversation_id, None).await?;
            tracing::debug!(%conversation_id, count = page.len(), "fetched message page");
            self.merge_history(conversation_id, page)?;
        }
        Ok(())
    }

    /// Stop the runtime task, closing the transport.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send(Command::Shutdown)
    }

    /// Connection status
    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.clone()
    }

    /// Conversation list, newest first
    pub fn conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.conversations.clone()
    }

    /// Messages of the active conversation
    pub fn messages(&self) -> watch::Receiver<ActiveMessages> {
        self.messages.clone()
    }

    /// Typing users by conversation
    pub fn typing(&self) -> watch::Receiver<TypingMap> {
        self.typing.clone()
    }

    /// Every update in order, including permanent send failures and server
    /// errors.
    pub fn updates(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), ClientError> {
        let (reply, outcome) = oneshot::channel();
        self.send(command(reply))?;
        outcome.await.map_err(|_| ClientError::Closed)??;
        Ok(())
    }
}
