//! Runtime task driving the Sans-IO engine.
//!
//! One task owns the [`SyncEngine`] and the [`Transport`]. It waits on three
//! sources: caller commands, transport events and the engine's next timer.
//! Whatever fires is fed to the engine, and the returned actions are executed
//! in order before the next wait. Observers are published to only from here,
//! so updates arrive in the order the engine produced them.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    time::Duration,
};

use parley_core::{Environment, PendingAction, SessionState};
use parley_proto::{Conversation, ConversationId, Message, MessageId, UserId};
use parley_sync::{
    Connectivity, EngineAction, EngineError, MessageDraft, MessageStore, SyncEngine, SyncUpdate,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::transport::{Transport, TransportEvent};

/// Capacity of the update broadcast; slow receivers see `Lagged`.
pub const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Acknowledgement of a command that can fail.
pub type Reply = oneshot::Sender<Result<(), EngineError>>;

/// Messages of the conversation on screen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveMessages {
    /// Active conversation, if any
    pub conversation_id: Option<ConversationId>,
    /// Its messages in display order
    pub messages: Vec<Message>,
}

/// Typing users by conversation. Conversations with nobody typing are absent.
pub type TypingMap = BTreeMap<ConversationId, BTreeSet<UserId>>;

/// Requests from [`crate::SyncClient`] handles.
#[derive(Debug)]
pub enum Command {
    /// Start a session
    Connect {
        /// Session token
        token: String,
        /// Outcome
        reply: Reply,
    },
    /// Intentional logout
    Disconnect,
    /// Send a composed message
    SendMessage {
        /// Message to send
        draft: MessageDraft,
        /// Temp id already returned to the caller
        temp_id: MessageId,
        /// Sent once the optimistic copy is in the view
        reply: Reply,
    },
    /// Send a failed message again
    Retry {
        /// Conversation id
        conversation_id: ConversationId,
        /// Temp id of the failed message
        message_id: MessageId,
        /// Outcome
        reply: Reply,
    },
    /// Typing indicator
    SetTyping {
        /// Conversation id
        conversation_id: ConversationId,
        /// Started or stopped
        is_typing: bool,
    },
    /// Toggle a reaction
    SendReaction {
        /// Conversation id
        conversation_id: ConversationId,
        /// Target message
        message_id: MessageId,
        /// Reaction
        emoji: String,
        /// Outcome
        reply: Reply,
    },
    /// Reset unread and send a read receipt
    MarkRead {
        /// Conversation id
        conversation_id: ConversationId,
    },
    /// Open a conversation
    Join {
        /// Conversation id
        conversation_id: ConversationId,
    },
    /// Close a conversation
    Leave {
        /// Conversation id
        conversation_id: ConversationId,
    },
    /// Foreground or network regained
    EnsureConnected,
    /// App backgrounded
    EnterBackground,
    /// REST message page
    MergeHistory {
        /// Conversation id
        conversation_id: ConversationId,
        /// Messages of the page
        page: Vec<Message>,
    },
    /// REST conversation list
    MergeConversations {
        /// Conversations
        conversations: Vec<Conversation>,
    },
    /// Page older messages in from the cache
    LoadOlder {
        /// Conversation id
        conversation_id: ConversationId,
        /// Page size
        limit: usize,
        /// Outcome
        reply: Reply,
    },
    /// Close the transport and stop the task
    Shutdown,
}

/// Observer channels, written only by the runtime.
pub struct Observers {
    /// Connection status
    pub connectivity: watch::Sender<Connectivity>,
    /// Conversation list, newest first
    pub conversations: watch::Sender<Vec<Conversation>>,
    /// Messages of the active conversation
    pub messages: watch::Sender<ActiveMessages>,
    /// Typing sets
    pub typing: watch::Sender<TypingMap>,
    /// Every update, in order
    pub updates: broadcast::Sender<SyncUpdate>,
}

impl Observers {
    /// Channels seeded with initial values.
    pub fn new(conversations: Vec<Conversation>) -> Self {
        Self {
            connectivity: watch::Sender::new(Connectivity::Disconnected),
            conversations: watch::Sender::new(conversations),
            messages: watch::Sender::new(ActiveMessages::default()),
            typing: watch::Sender::new(TypingMap::new()),
            updates: broadcast::Sender::new(UPDATE_CHANNEL_CAPACITY),
        }
    }
}

enum Step {
    Command(Command),
    Transport(TransportEvent),
    Tick,
    Stop,
}

/// The runtime task state.
pub struct Runtime<E: Environment, S: MessageStore> {
    env: E,
    engine: SyncEngine<E, S>,
    transport: Transport,
    commands: mpsc::UnboundedReceiver<Command>,
    observers: Observers,
}

impl<E: Environment, S: MessageStore> Runtime<E, S> {
    /// Wrap an engine. Nothing runs until [`Runtime::run`].
    pub fn new(
        env: E,
        engine: SyncEngine<E, S>,
        commands: mpsc::UnboundedReceiver<Command>,
        observers: Observers,
    ) -> Self {
        Self { env, engine, transport: Transport::new(), commands, observers }
    }

    /// Process commands, transport events and timers until shutdown or until
    /// every handle is dropped.
    pub async fn run(mut self) {
        tracing::debug!("sync runtime started");
        loop {
            let timeout = self.engine.poll_timeout(self.env.now());
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => Step::Stop,
                    Some(command) => Step::Command(command),
                },
                event = self.transport.recv() => Step::Transport(event),
                () = wait(&self.env, timeout) => Step::Tick,
            };

            let actions = match step {
                Step::Command(command) => self.handle_command(command),
                Step::Transport(event) => self.handle_transport(event),
                Step::Tick => self.engine.tick(self.env.now()),
                Step::Stop => break,
            };
            self.execute(actions).await;
        }

        self.transport.close().await;
        tracing::debug!("sync runtime stopped");
    }

    fn handle_command(&mut self, command: Command) -> Vec<EngineAction> {
        let now = self.env.now();
        match command {
            Command::Connect { token, reply } => answer(reply, self.engine.connect(&token, now)),
            Command::Disconnect => self.engine.disconnect(now),
            Command::SendMessage { draft, temp_id, reply } => {
                answer(reply, self.engine.send_message(draft, temp_id))
            },
            Command::Retry { conversation_id, message_id, reply } => {
                answer(reply, self.engine.retry_message(&conversation_id, &message_id))
            },
            Command::SetTyping { conversation_id, is_typing } => {
                logged("set_typing", self.engine.set_typing(&conversation_id, is_typing))
            },
            Command::SendReaction { conversation_id, message_id, emoji, reply } => {
                answer(reply, self.engine.send_reaction(&conversation_id, &message_id, &emoji))
            },
            Command::MarkRead { conversation_id } => {
                logged("mark_read", self.engine.mark_read(&conversation_id))
            },
            Command::Join { conversation_id } => {
                logged("join", self.engine.join_conversation(&conversation_id))
            },
            Command::Leave { conversation_id } => {
                logged("leave", self.engine.leave_conversation(&conversation_id))
            },
            Command::EnsureConnected => self.engine.ensure_connected(now),
            Command::EnterBackground => {
                self.engine.enter_background();
                Vec::new()
            },
            Command::MergeHistory { conversation_id, page } => {
                self.engine.merge_history(&conversation_id, page)
            },
            Command::MergeConversations { conversations } => {
                self.engine.merge_conversations(conversations)
            },
            Command::LoadOlder { conversation_id, limit, reply } => {
                answer(reply, self.engine.load_older(&conversation_id, limit))
            },
            // Handled by the loop
            Command::Shutdown => Vec::new(),
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) -> Vec<EngineAction> {
        let now = self.env.now();
        match event {
            TransportEvent::Opened => self.engine.transport_opened(now),
            TransportEvent::Text(text) => self.engine.handle_text(&text),
            TransportEvent::Binary(bytes) => self.engine.handle_binary(&bytes),
            TransportEvent::Pong => {
                self.engine.pong_received(now);
                Vec::new()
            },
            TransportEvent::Closed => self.engine.transport_closed(now),
            TransportEvent::Failed(error) => self.engine.transport_failed(&error, now),
        }
    }

    /// Execute actions in order. Follow-up actions from transport outcomes
    /// run before anything queued behind them.
    async fn execute(&mut self, actions: Vec<EngineAction>) {
        let mut work: VecDeque<EngineAction> = actions.into();

        while let Some(action) = work.pop_front() {
            match action {
                EngineAction::OpenTransport { url } => self.transport.open(url),
                EngineAction::CloseTransport => {
                    self.transport.close().await;
                    if self.engine.session_state() == SessionState::Closing {
                        let follow_up = self.engine.transport_closed(self.env.now());
                        prepend(&mut work, follow_up);
                    }
                },
                EngineAction::Transmit(pending) => {
                    if !self.transport.is_open() {
                        let mut unsent = vec![pending];
                        unsent.extend(take_transmits(&mut work));
                        tracing::debug!(count = unsent.len(), "transport not open, returning sends to queue");
                        self.engine.restore_unsent(unsent);
                        continue;
                    }

                    let text = match pending.envelope().encode() {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::warn!(action = pending.action(), %error, "dropping unencodable action");
                            continue;
                        },
                    };

                    if let Err(error) = self.transport.send_text(text).await {
                        self.engine.restore_unsent(take_transmits(&mut work));
                        let follow_up = self.engine.transmit_failed(pending, &error, self.env.now());
                        prepend(&mut work, follow_up);
                    }
                },
                EngineAction::SendPing => {
                    if let Err(error) = self.transport.send_ping().await {
                        let follow_up = self.engine.transport_failed(&error, self.env.now());
                        prepend(&mut work, follow_up);
                    }
                },
                EngineAction::Notify(update) => self.publish(update),
            }
        }
    }

    fn publish(&self, update: SyncUpdate) {
        match &update {
            SyncUpdate::Connectivity(connectivity) => {
                self.observers.connectivity.send_replace(*connectivity);
            },
            SyncUpdate::Conversations => {
                self.observers.conversations.send_replace(self.engine.conversations().to_vec());
            },
            SyncUpdate::Messages { conversation_id } => {
                let active = self.engine.active_conversation();
                let shown = self.observers.messages.borrow().conversation_id.clone();
                if active == Some(conversation_id.as_str()) || shown.as_deref() == Some(conversation_id.as_str()) {
                    self.observers.messages.send_replace(ActiveMessages {
                        conversation_id: active.map(str::to_string),
                        messages: active.map(|id| self.engine.messages(id).to_vec()).unwrap_or_default(),
                    });
                }
            },
            SyncUpdate::Typing { conversation_id } => {
                let typing = self.engine.typing(conversation_id);
                self.observers.typing.send_modify(|map| {
                    if typing.is_empty() {
                        map.remove(conversation_id);
                    } else {
                        map.insert(conversation_id.clone(), typing);
                    }
                });
            },
            SyncUpdate::SendFailed { .. } | SyncUpdate::ServerError { .. } => {},
        }

        // No receivers is fine
        let _ = self.observers.updates.send(update);
    }
}

async fn wait<E: Environment>(env: &E, timeout: Option<Duration>) {
    match timeout {
        Some(duration) => env.sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn answer(reply: Reply, result: Result<Vec<EngineAction>, EngineError>) -> Vec<EngineAction> {
    match result {
        Ok(actions) => {
            let _ = reply.send(Ok(()));
            actions
        },
        Err(error) => {
            let _ = reply.send(Err(error));
            Vec::new()
        },
    }
}

fn logged(operation: &str, result: Result<Vec<EngineAction>, EngineError>) -> Vec<EngineAction> {
    result.unwrap_or_else(|error| {
        tracing::warn!(operation, %error, "command failed");
        Vec::new()
    })
}

/// Remove every `Transmit` from `work`, keeping the other actions in place.
fn take_transmits(work: &mut VecDeque<EngineAction>) -> Vec<PendingAction> {
    let mut transmits = Vec::new();
    work.retain(|action| match action {
        EngineAction::Transmit(pending) => {
            transmits.push(pending.clone());
            false
        },
        _ => true,
    });
    transmits
}

fn prepend(work: &mut VecDeque<EngineAction>, actions: Vec<EngineAction>) {
    for action in actions.into_iter().rev() {
        work.push_front(action);
    }
}
