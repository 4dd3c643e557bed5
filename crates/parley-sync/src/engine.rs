//! Sans-IO sync engine.
//!
//! [`SyncEngine`] owns the connection state machine, the outgoing queue, the
//! in-memory [`SyncState`] and the local store. It is the only writer to the
//! store. Like [`Connection`], it performs no I/O: every method takes the
//! current time and returns [`EngineAction`]s for the driver.
//!
//! # Data flow
//!
//! ```text
//! caller ──send_message──> optimistic append ──> queue / Transmit
//!                                                      │
//! transport ──handle_text──> Inbound ──> reconcile ──> store ──> Notify
//! ```
//!
//! The driver executes actions in order and reports back:
//!
//! - `OpenTransport` → [`SyncEngine::transport_opened`] or
//!   [`SyncEngine::transport_failed`]
//! - `Transmit` failed → [`SyncEngine::transmit_failed`]; never written (the
//!   transport went away first) → [`SyncEngine::restore_unsent`]
//! - peer close → [`SyncEngine::transport_closed`]
//! - timers → [`SyncEngine::tick`] no later than [`SyncEngine::poll_timeout`]
//!
//! A written send stays tracked until its echo arrives. If the connection
//! drops first, the next connect sends it again; the server deduplicates by
//! `tempId`.

use std::collections::BTreeSet;

use chrono::TimeDelta;
use parley_core::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionError, Environment, OfflineReason,
    OutgoingQueue, PendingAction, SessionState, queue::DEFAULT_MAX_RETRIES,
};
use parley_proto::{
    Attachment, Conversation, ConversationId, Envelope, Inbound, Message, MessageId, MessageKind,
    MessageStatus, Outbound, ProtocolError, Reactions, ReplyTo, UserId,
    inbound::ServerError,
    model::temp_id,
    outbound::{ConversationRef, ReactionToggle, ReadReceipt, SendMessage, TypingNotice},
};

use crate::{
    error::EngineError,
    reconciler::{self, Change, DEFAULT_OPTIMISTIC_WINDOW_SECS, ReconcileContext},
    state::SyncState,
    store::{Cursor, MESSAGE_CACHE_CAP, MessageStore},
};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connection lifecycle settings
    pub connection: ConnectionConfig,
    /// Send attempts per queued action
    pub max_send_retries: u32,
    /// Window for matching an echo without `tempId` to an optimistic message
    pub optimistic_window: TimeDelta,
    /// Messages loaded from the cache when a conversation is joined
    pub cache_capacity: usize,
}

impl EngineConfig {
    /// Defaults for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(endpoint),
            max_send_retries: DEFAULT_MAX_RETRIES,
            optimistic_window: TimeDelta::seconds(DEFAULT_OPTIMISTIC_WINDOW_SECS),
            cache_capacity: MESSAGE_CACHE_CAP,
        }
    }
}

/// A message the user composed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// Text, or caption for attachments
    pub content: String,
    /// Content type
    pub kind: MessageKind,
    /// Previously uploaded blob
    pub attachment: Option<Attachment>,
    /// Message being replied to
    pub reply_to: Option<ReplyTo>,
    /// Ask the server to translate the attached document
    pub translate_document: Option<bool>,
}

impl MessageDraft {
    /// Plain text draft
    pub fn text(conversation_id: impl Into<ConversationId>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            kind: MessageKind::Text,
            attachment: None,
            reply_to: None,
            translate_document: None,
        }
    }
}

/// Connection status as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connectivity {
    /// No session
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Online
    Connected,
    /// Waiting out a backoff delay
    Reconnecting {
        /// Failed attempts so far
        attempt: u32,
    },
    /// Gave up until the user acts
    Offline(OfflineReason),
}

/// Observer notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    /// Connection status changed
    Connectivity(Connectivity),
    /// Conversation list changed (contents or order)
    Conversations,
    /// Messages of a conversation changed
    Messages {
        /// Conversation id
        conversation_id: ConversationId,
    },
    /// Typing set of a conversation changed
    Typing {
        /// Conversation id
        conversation_id: ConversationId,
    },
    /// A send exhausted its retries; the message is now `failed`
    SendFailed {
        /// Conversation id
        conversation_id: ConversationId,
        /// Temp id of the failed message
        temp_id: MessageId,
    },
    /// Server reported an error
    ServerError {
        /// Server error code, rendered as text
        code: String,
        /// Human-readable message
        message: String,
    },
}

/// Actions for the driver to execute, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Open the transport to this URL (token included)
    OpenTransport {
        /// Endpoint with the token query parameter
        url: String,
    },
    /// Close the current transport
    CloseTransport,
    /// Write this envelope to the transport
    Transmit(PendingAction),
    /// Send a keepalive ping
    SendPing,
    /// Publish to observers
    Notify(SyncUpdate),
}

/// Sans-IO sync engine.
pub struct SyncEngine<E: Environment, S: MessageStore> {
    env: E,
    store: S,
    config: EngineConfig,
    connection: Connection<E::Instant>,
    queue: OutgoingQueue,
    /// Sends written to the wire and not yet acknowledged, in send order
    in_flight: Vec<PendingAction>,
    state: SyncState,
    /// Conversations to re-join after every reconnect
    joined: BTreeSet<ConversationId>,
    /// Conversations whose cached messages were already loaded
    loaded: BTreeSet<ConversationId>,
    offline: Option<OfflineReason>,
    /// Last connectivity published to observers
    connectivity: Connectivity,
}

impl<E: Environment, S: MessageStore> SyncEngine<E, S> {
    /// Create an engine for `local_user_id`, loading cached conversations.
    ///
    /// A failing store is logged and the engine starts empty.
    pub fn new(env: E, store: S, local_user_id: impl Into<UserId>, config: EngineConfig) -> Self {
        let seed = env.random_u64();
        let mut state = SyncState::new(local_user_id);

        match store.load_conversations() {
            Ok(cached) => {
                tracing::debug!(count = cached.len(), "loaded cached conversations");
                reconciler::merge_conversations(&mut state, cached);
            },
            Err(error) => tracing::warn!(%error, "failed to load cached conversations"),
        }

        Self {
            env,
            store,
            connection: Connection::new(config.connection.clone(), seed),
            queue: OutgoingQueue::new(config.max_send_retries),
            in_flight: Vec::new(),
            config,
            state,
            joined: BTreeSet::new(),
            loaded: BTreeSet::new(),
            offline: None,
            connectivity: Connectivity::Disconnected,
        }
    }

    /// Current connection status
    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    /// Underlying session state
    pub fn session_state(&self) -> SessionState {
        self.connection.state()
    }

    /// In-memory view
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Conversations, newest first
    pub fn conversations(&self) -> &[Conversation] {
        self.state.conversations.as_slice()
    }

    /// Messages of a conversation in display order
    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.state.log(conversation_id).map(|log| log.as_slice()).unwrap_or_default()
    }

    /// Users typing in a conversation
    pub fn typing(&self, conversation_id: &str) -> BTreeSet<UserId> {
        self.state.typing_in(conversation_id)
    }

    /// Conversation on screen
    pub fn active_conversation(&self) -> Option<&str> {
        self.state.active.as_deref()
    }

    /// Conversations re-joined on every connect
    pub fn joined(&self) -> impl Iterator<Item = &str> {
        self.joined.iter().map(String::as_str)
    }

    /// Actions waiting for a connected transport
    pub fn queue(&self) -> &OutgoingQueue {
        &self.queue
    }

    /// Sends written since their last (re)connect and awaiting the echo
    pub fn in_flight(&self) -> &[PendingAction] {
        &self.in_flight
    }

    /// Local store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fresh temp id from the environment clock and RNG.
    pub fn next_temp_id(&self) -> MessageId {
        temp_id(self.env.wall_clock().timestamp_millis(), self.env.random_u32())
    }

    /// Start a session with `token`.
    ///
    /// # Errors
    ///
    /// - `EngineError::Connection` if the configured endpoint is invalid
    pub fn connect(&mut self, token: &str, now: E::Instant) -> Result<Vec<EngineAction>, EngineError> {
        let actions = self.connection.connect(token, now)?;
        self.offline = None;
        Ok(self.run(actions))
    }

    /// Intentional logout.
    ///
    /// Clears the queue (queued sends become `failed`), the joined set and
    /// typing indicators. Never reconnects afterwards.
    pub fn disconnect(&mut self, now: E::Instant) -> Vec<EngineAction> {
        let connection_actions = self.connection.disconnect(now);
        self.joined.clear();
        self.offline = None;
        let mut actions = self.run(connection_actions);
        actions.extend(self.clear_typing());
        actions
    }

    /// App came to the foreground or the network returned.
    pub fn ensure_connected(&mut self, now: E::Instant) -> Vec<EngineAction> {
        if !self.connection.is_auth_rejected() && self.connection.token().is_some() {
            self.offline = None;
        }
        let actions = self.connection.ensure_connected(now);
        self.run(actions)
    }

    /// App went to the background.
    pub fn enter_background(&mut self) {
        self.connection.enter_background();
    }

    /// The transport completed its handshake.
    pub fn transport_opened(&mut self, now: E::Instant) -> Vec<EngineAction> {
        let actions = self.connection.transport_opened(now);
        self.run(actions)
    }

    /// The transport failed to open, or failed while open.
    pub fn transport_failed(&mut self, error: &ConnectionError, now: E::Instant) -> Vec<EngineAction> {
        let actions = self.connection.transport_failed(error, now);
        self.run(actions)
    }

    /// The transport closed.
    pub fn transport_closed(&mut self, now: E::Instant) -> Vec<EngineAction> {
        let actions = self.connection.transport_closed(now);
        self.run(actions)
    }

    /// The server answered a ping.
    pub fn pong_received(&mut self, now: E::Instant) {
        self.connection.pong_received(now);
    }

    /// Advance timers.
    pub fn tick(&mut self, now: E::Instant) -> Vec<EngineAction> {
        let actions = self.connection.tick(now);
        self.run(actions)
    }

    /// Time until [`SyncEngine::tick`] must be called.
    pub fn poll_timeout(&self, now: E::Instant) -> Option<std::time::Duration> {
        self.connection.poll_timeout(now)
    }

    /// A text frame arrived.
    pub fn handle_text(&mut self, text: &str) -> Vec<EngineAction> {
        match Inbound::decode_frame(text) {
            Ok(event) => self.handle_inbound(event),
            Err(error) => {
                Self::log_decode_error(&error);
                Vec::new()
            },
        }
    }

    /// A binary frame arrived (UTF-8 JSON).
    pub fn handle_binary(&mut self, bytes: &[u8]) -> Vec<EngineAction> {
        match Envelope::decode_bytes(bytes).and_then(Inbound::from_envelope) {
            Ok(event) => self.handle_inbound(event),
            Err(error) => {
                Self::log_decode_error(&error);
                Vec::new()
            },
        }
    }

    /// A decoded server event.
    pub fn handle_inbound(&mut self, event: Inbound) -> Vec<EngineAction> {
        if let Inbound::Error(error) = event {
            return self.server_error(error);
        }

        let action = event.action();
        let ctx = self.reconcile_context();
        let changes = reconciler::reconcile(&mut self.state, event, &ctx);
        tracing::debug!(action, changes = changes.len(), "reconciled event");
        self.apply(&changes)
    }

    /// A `Transmit` could not be written.
    ///
    /// Replayable actions go back to the front of the queue with their
    /// attempt count; the error is then handled as a transport failure. Call
    /// [`SyncEngine::restore_unsent`] for the actions behind it first, so
    /// the queue keeps send order. After a logout the message is marked
    /// failed instead.
    pub fn transmit_failed(
        &mut self,
        action: PendingAction,
        error: &ConnectionError,
        now: E::Instant,
    ) -> Vec<EngineAction> {
        tracing::warn!(action = action.action(), %error, "send failed");
        if let Some(temp_id) = action.temp_id() {
            let temp_id = temp_id.to_string();
            self.untrack(&temp_id);
        }

        let mut actions = Vec::new();
        if self.connection.token().is_none() {
            actions.extend(self.fail_send(&action));
            return actions;
        }

        if action.is_replayable() {
            self.queue.requeue(action);
        }
        let connection_actions = self.connection.transport_failed(error, now);
        actions.extend(self.run(connection_actions));
        actions
    }

    /// Return `Transmit` actions that were never written to the wire.
    pub fn restore_unsent(&mut self, unsent: Vec<PendingAction>) {
        for pending in &unsent {
            if let Some(temp_id) = pending.temp_id() {
                self.in_flight.retain(|p| p.temp_id() != Some(temp_id));
            }
        }
        let replayable: Vec<_> = unsent.into_iter().filter(PendingAction::is_replayable).collect();
        self.queue.restore(replayable);
    }

    /// Send a message with a caller-chosen temp id.
    ///
    /// The optimistic copy is appended (status `sending`) before anything is
    /// sent. Offline, the send waits in the queue for the next connect.
    ///
    /// # Errors
    ///
    /// - `EngineError::Protocol` if the payload cannot be encoded; nothing is
    ///   appended in that case
    pub fn send_message(&mut self, draft: MessageDraft, temp_id: MessageId) -> Result<Vec<EngineAction>, EngineError> {
        let outbound = Outbound::SendMessage(SendMessage {
            conversation_id: draft.conversation_id.clone(),
            content: draft.content.clone(),
            kind: draft.kind,
            temp_id: Some(temp_id.clone()),
            attachment: draft.attachment.clone(),
            translate_document: draft.translate_document,
            reply_to: draft.reply_to.as_ref().map(|r| r.message_id.clone()),
        });
        let pending = PendingAction::from_outbound(outbound)?;

        let message = Message {
            id: temp_id,
            conversation_id: draft.conversation_id,
            sender_id: self.state.local_user_id.clone(),
            original_content: draft.content,
            original_language: None,
            translated_content: None,
            target_language: None,
            kind: draft.kind,
            status: MessageStatus::Sending,
            created_at: self.env.wall_clock(),
            reactions: Reactions::new(),
            attachment: draft.attachment,
            reply_to: draft.reply_to,
            deleted_at: None,
            deleted_by: None,
        };
        tracing::debug!(temp_id = %message.id, conversation_id = %message.conversation_id, "sending message");

        let changes = reconciler::append_optimistic(&mut self.state, message);
        let mut actions = self.apply(&changes);
        actions.extend(self.dispatch(pending));
        Ok(actions)
    }

    /// Send a failed message again.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownMessage` if the message is not in the view
    /// - `EngineError::NotRetryable` if it is not a failed optimistic send
    pub fn retry_message(&mut self, conversation_id: &str, message_id: &str) -> Result<Vec<EngineAction>, EngineError> {
        let message = self.find_message(conversation_id, message_id)?.clone();
        if !message.is_optimistic() || message.status != MessageStatus::Failed {
            return Err(EngineError::NotRetryable { message_id: message_id.to_string() });
        }

        let pending = PendingAction::from_outbound(Outbound::SendMessage(SendMessage {
            conversation_id: message.conversation_id.clone(),
            content: message.original_content.clone(),
            kind: message.kind,
            temp_id: Some(message.id.clone()),
            attachment: message.attachment.clone(),
            translate_document: None,
            reply_to: message.reply_to.as_ref().map(|r| r.message_id.clone()),
        }))?;

        tracing::info!(%message_id, "retrying send");
        let changes = reconciler::mark_sending(&mut self.state, conversation_id, message_id);
        let mut actions = self.apply(&changes);
        actions.extend(self.dispatch(pending));
        Ok(actions)
    }

    /// Typing indicator. Dropped while offline.
    ///
    /// # Errors
    ///
    /// - `EngineError::Protocol` if the payload cannot be encoded
    pub fn set_typing(&mut self, conversation_id: &str, is_typing: bool) -> Result<Vec<EngineAction>, EngineError> {
        let pending = PendingAction::from_outbound(Outbound::Typing(TypingNotice {
            conversation_id: conversation_id.to_string(),
            is_typing,
        }))?;
        Ok(self.dispatch(pending))
    }

    /// Toggle a reaction on a message.
    ///
    /// # Errors
    ///
    /// - `EngineError::UnknownMessage` if the message is not in the view
    /// - `EngineError::Protocol` if the payload cannot be encoded
    pub fn send_reaction(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Vec<EngineAction>, EngineError> {
        let message_timestamp = self.find_message(conversation_id, message_id)?.created_at;
        let pending = PendingAction::from_outbound(Outbound::Reaction(ReactionToggle {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            message_timestamp,
            emoji: emoji.to_string(),
        }))?;
        Ok(self.dispatch(pending))
    }

    /// Reset the unread count and send a read receipt for the newest server
    /// message.
    ///
    /// # Errors
    ///
    /// - `EngineError::Protocol` if the payload cannot be encoded
    pub fn mark_read(&mut self, conversation_id: &str) -> Result<Vec<EngineAction>, EngineError> {
        let changes = reconciler::mark_read(&mut self.state, conversation_id);
        let mut actions = self.apply(&changes);

        let newest = self.state.log(conversation_id).and_then(|log| {
            log.iter().filter(|m| !m.is_optimistic()).max_by_key(|m| m.created_at).map(|m| m.id.clone())
        });
        if let Some(message_id) = newest {
            let pending = PendingAction::from_outbound(Outbound::Read(ReadReceipt {
                conversation_id: conversation_id.to_string(),
                message_id,
            }))?;
            actions.extend(self.dispatch(pending));
        }
        Ok(actions)
    }

    /// Open a conversation: make it active, load its cached messages and
    /// subscribe to its events (now if connected, otherwise on connect).
    ///
    /// Cached optimistic messages left `sending` by an earlier session are
    /// marked `failed` on first load.
    ///
    /// # Errors
    ///
    /// - `EngineError::Protocol` if the join payload cannot be encoded
    pub fn join_conversation(&mut self, conversation_id: &str) -> Result<Vec<EngineAction>, EngineError> {
        self.state.active = Some(conversation_id.to_string());
        self.joined.insert(conversation_id.to_string());

        let mut actions = Vec::new();
        if self.loaded.insert(conversation_id.to_string()) {
            actions.extend(self.load_cached(conversation_id));
        }

        let changes = reconciler::mark_read(&mut self.state, conversation_id);
        actions.extend(self.apply(&changes));

        if self.connection.state() == SessionState::Connected {
            let pending = PendingAction::from_outbound(Outbound::Join(ConversationRef {
                conversation_id: conversation_id.to_string(),
            }))?;
            actions.extend(self.dispatch(pending));
        }

        push_notify(&mut actions, SyncUpdate::Messages { conversation_id: conversation_id.to_string() });
        Ok(actions)
    }

    /// Unsubscribe from a conversation. Safe in any state.
    ///
    /// # Errors
    ///
    /// - `EngineError::Protocol` if the leave payload cannot be encoded
    pub fn leave_conversation(&mut self, conversation_id: &str) -> Result<Vec<EngineAction>, EngineError> {
        let was_joined = self.joined.remove(conversation_id);

        let mut actions = Vec::new();
        if self.state.active.as_deref() == Some(conversation_id) {
            self.state.active = None;
            push_notify(&mut actions, SyncUpdate::Messages { conversation_id: conversation_id.to_string() });
        }
        if self.state.typing.remove(conversation_id).is_some() {
            push_notify(&mut actions, SyncUpdate::Typing { conversation_id: conversation_id.to_string() });
        }

        if was_joined && self.connection.state() == SessionState::Connected {
            let pending = PendingAction::from_outbound(Outbound::Leave(ConversationRef {
                conversation_id: conversation_id.to_string(),
            }))?;
            actions.extend(self.dispatch(pending));
        }
        Ok(actions)
    }

    /// Merge a REST history page.
    pub fn merge_history(&mut self, conversation_id: &str, page: Vec<Message>) -> Vec<EngineAction> {
        let changes = reconciler::merge_history(&mut self.state, conversation_id, page);
        self.apply(&changes)
    }

    /// Merge a REST conversation list.
    pub fn merge_conversations(&mut self, conversations: Vec<Conversation>) -> Vec<EngineAction> {
        let changes = reconciler::merge_conversations(&mut self.state, conversations);
        self.apply(&changes)
    }

    /// Pull up to `limit` cached messages older than the oldest one in view.
    ///
    /// # Errors
    ///
    /// - `EngineError::Storage` if the cache cannot be read
    pub fn load_older(&mut self, conversation_id: &str, limit: usize) -> Result<Vec<EngineAction>, EngineError> {
        let oldest = self
            .state
            .log(conversation_id)
            .and_then(|log| log.iter().min_by(|a, b| Cursor::of(a).cmp(&Cursor::of(b))))
            .map(Cursor::of);
        let Some(before) = oldest else {
            return Ok(Vec::new());
        };
        let page = self.store.load_older(conversation_id, &before, limit)?;
        let changes = reconciler::merge_history(&mut self.state, conversation_id, page);
        Ok(self.notify(&changes))
    }

    fn load_cached(&mut self, conversation_id: &str) -> Vec<EngineAction> {
        let cached = match self.store.load_messages(conversation_id, None, self.config.cache_capacity) {
            Ok(cached) => cached,
            Err(error) => {
                tracing::warn!(%conversation_id, %error, "failed to load cached messages");
                return Vec::new();
            },
        };

        let in_memory: BTreeSet<MessageId> =
            self.state.log(conversation_id).map(|log| log.iter().map(|m| m.id.clone()).collect()).unwrap_or_default();
        let stale: Vec<MessageId> = cached
            .iter()
            .filter(|m| {
                m.is_optimistic()
                    && m.status == MessageStatus::Sending
                    && !in_memory.contains(&m.id)
                    && !self.queue.contains_send(&m.id)
            })
            .map(|m| m.id.clone())
            .collect();

        tracing::debug!(%conversation_id, count = cached.len(), stale = stale.len(), "loaded cached messages");
        let changes = reconciler::merge_history(&mut self.state, conversation_id, cached);
        let mut actions = self.notify(&changes);

        for temp_id in stale {
            let changes = reconciler::mark_failed(&mut self.state, conversation_id, &temp_id);
            actions.extend(self.apply(&changes));
        }
        actions
    }

    fn find_message(&self, conversation_id: &str, message_id: &str) -> Result<&Message, EngineError> {
        self.state.log(conversation_id).and_then(|log| log.get(message_id)).ok_or_else(|| {
            EngineError::UnknownMessage {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            }
        })
    }

    fn reconcile_context(&self) -> ReconcileContext {
        ReconcileContext { now: self.env.wall_clock(), optimistic_window: self.config.optimistic_window }
    }

    fn server_error(&mut self, error: ServerError) -> Vec<EngineAction> {
        if error.is_unauthorized() {
            let actions = self.connection.reject_auth(&error.message);
            return self.run(actions);
        }

        let code = error.code_text();
        tracing::warn!(%code, message = %error.message, "server error");
        vec![EngineAction::Notify(SyncUpdate::ServerError { code, message: error.message })]
    }

    fn log_decode_error(error: &ProtocolError) {
        if error.is_unknown_action() {
            tracing::debug!(%error, "ignoring unknown action");
        } else {
            tracing::debug!(%error, "dropping undecodable frame");
        }
    }

    /// Transmit now if connected, otherwise queue (replayable actions only).
    fn dispatch(&mut self, mut pending: PendingAction) -> Vec<EngineAction> {
        if self.connection.state() == SessionState::Connected {
            pending.mark_attempt();
            self.track(&pending);
            return vec![EngineAction::Transmit(pending)];
        }

        if self.queue.enqueue(pending) {
            tracing::debug!(queued = self.queue.len(), "queued while offline");
        }
        Vec::new()
    }

    /// Translate connection actions, then publish connectivity if it changed.
    fn run(&mut self, connection_actions: Vec<ConnectionAction>) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for action in connection_actions {
            match action {
                ConnectionAction::OpenTransport { url } => actions.push(EngineAction::OpenTransport { url }),
                ConnectionAction::CloseTransport => actions.push(EngineAction::CloseTransport),
                ConnectionAction::SendPing => actions.push(EngineAction::SendPing),
                ConnectionAction::FlushQueue => actions.extend(self.flush()),
                ConnectionAction::ClearQueue => {
                    let mut cleared = std::mem::take(&mut self.in_flight);
                    cleared.extend(self.queue.clear());
                    for pending in cleared {
                        actions.extend(self.fail_send(&pending));
                    }
                },
                ConnectionAction::Offline { reason } => {
                    tracing::warn!(?reason, "offline");
                    self.offline = Some(reason);
                },
            }
        }

        let connectivity = self.current_connectivity();
        if connectivity != self.connectivity {
            let was_connected = self.connectivity == Connectivity::Connected;
            self.connectivity = connectivity;
            actions.push(EngineAction::Notify(SyncUpdate::Connectivity(connectivity)));

            // Typing events stop with the subscription
            if was_connected {
                actions.extend(self.clear_typing());
            }
        }
        actions
    }

    /// Re-join subscriptions, then flush the queue. Runs once per connect.
    fn flush(&mut self) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        let joined: Vec<ConversationId> = self.joined.iter().cloned().collect();
        for conversation_id in joined {
            match PendingAction::from_outbound(Outbound::Join(ConversationRef { conversation_id })) {
                Ok(mut pending) => {
                    pending.mark_attempt();
                    actions.push(EngineAction::Transmit(pending));
                },
                Err(error) => tracing::warn!(%error, "failed to encode join"),
            }
        }

        // Written last session but never acknowledged: send again, ahead of
        // anything queued since
        let unacknowledged = std::mem::take(&mut self.in_flight);
        for pending in unacknowledged.into_iter().rev() {
            let queued = pending.temp_id().is_some_and(|temp_id| self.queue.contains_send(temp_id));
            if !queued {
                tracing::debug!(temp_id = ?pending.temp_id(), "replaying unacknowledged send");
                self.queue.requeue(pending);
            }
        }

        let flush = self.queue.flush();
        tracing::info!(ready = flush.ready.len(), dropped = flush.dropped.len(), "flushing queue");
        for pending in flush.dropped {
            actions.extend(self.fail_send(&pending));
        }
        for pending in flush.ready {
            self.track(&pending);
            actions.push(EngineAction::Transmit(pending));
        }
        actions
    }

    /// Remember a send handed out for writing until the server echoes it.
    fn track(&mut self, pending: &PendingAction) {
        if pending.temp_id().is_some() {
            self.in_flight.push(pending.clone());
        }
    }

    fn untrack(&mut self, temp_id: &str) {
        self.in_flight.retain(|pending| pending.temp_id() != Some(temp_id));
    }

    /// Mark the message behind a dropped send as failed.
    fn fail_send(&mut self, pending: &PendingAction) -> Vec<EngineAction> {
        let (Some(conversation_id), Some(temp_id)) = (pending.conversation_id(), pending.temp_id()) else {
            return Vec::new();
        };
        let conversation_id = conversation_id.to_string();
        let temp_id = temp_id.to_string();
        self.untrack(&temp_id);

        let changes = reconciler::mark_failed(&mut self.state, &conversation_id, &temp_id);
        if changes.is_empty() {
            // Already acknowledged or gone
            return Vec::new();
        }
        tracing::warn!(%conversation_id, %temp_id, "send failed permanently");

        let mut actions = self.apply(&changes);
        actions.push(EngineAction::Notify(SyncUpdate::SendFailed { conversation_id, temp_id }));
        actions
    }

    fn clear_typing(&mut self) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for (conversation_id, _) in std::mem::take(&mut self.state.typing) {
            push_notify(&mut actions, SyncUpdate::Typing { conversation_id });
        }
        actions
    }

    fn current_connectivity(&self) -> Connectivity {
        match self.connection.state() {
            SessionState::Connected => Connectivity::Connected,
            SessionState::Connecting => Connectivity::Connecting,
            SessionState::Reconnecting => Connectivity::Reconnecting { attempt: self.connection.attempt() },
            SessionState::Disconnected | SessionState::Closing => match self.offline {
                Some(reason) => Connectivity::Offline(reason),
                None => Connectivity::Disconnected,
            },
        }
    }

    /// Persist changes, then notify.
    fn apply(&mut self, changes: &[Change]) -> Vec<EngineAction> {
        for change in changes {
            self.persist(change);
        }
        self.notify(changes)
    }

    /// Write one change through to the store. Failures are logged; the
    /// in-memory view stays authoritative.
    fn persist(&mut self, change: &Change) {
        let result = match change {
            Change::MessageUpserted { conversation_id, message_id } => {
                match self.state.log(conversation_id).and_then(|log| log.get(message_id)) {
                    Some(message) => self.store.upsert_message(message),
                    None => Ok(()),
                }
            },
            Change::MessageReplaced { conversation_id, old_id, new_id } => {
                self.queue.cancel(old_id);
                self.untrack(old_id);
                match self.state.log(conversation_id).and_then(|log| log.get(new_id)) {
                    Some(message) => self.store.replace_message(conversation_id, old_id, message),
                    None => Ok(()),
                }
            },
            Change::MessageRemoved { conversation_id, message_id } => {
                self.queue.cancel(message_id);
                self.untrack(message_id);
                self.store.remove_message(conversation_id, message_id).map(|_| ())
            },
            Change::ConversationUpserted { conversation_id } => {
                match self.state.conversations.get(conversation_id) {
                    Some(conversation) => self.store.upsert_conversation(conversation),
                    None => Ok(()),
                }
            },
            Change::ConversationRemoved { conversation_id } => {
                self.joined.remove(conversation_id);
                self.loaded.remove(conversation_id);
                self.store.remove_conversation(conversation_id)
            },
            Change::ConversationsReordered | Change::TypingChanged { .. } => Ok(()),
        };

        if let Err(error) = result {
            tracing::warn!(?change, %error, "failed to persist change");
        }
    }

    /// Observer notifications for `changes`, one per topic.
    fn notify(&self, changes: &[Change]) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for change in changes {
            let update = match change {
                Change::MessageUpserted { conversation_id, .. }
                | Change::MessageReplaced { conversation_id, .. }
                | Change::MessageRemoved { conversation_id, .. } => {
                    SyncUpdate::Messages { conversation_id: conversation_id.clone() }
                },
                Change::TypingChanged { conversation_id } => {
                    SyncUpdate::Typing { conversation_id: conversation_id.clone() }
                },
                Change::ConversationUpserted { .. }
                | Change::ConversationRemoved { .. }
                | Change::ConversationsReordered => SyncUpdate::Conversations,
            };
            push_notify(&mut actions, update);
        }
        actions
    }
}

fn push_notify(actions: &mut Vec<EngineAction>, update: SyncUpdate) {
    let action = EngineAction::Notify(update);
    if !actions.contains(&action) {
        actions.push(action);
    }
}
