//! Simulation driver: engine, link and server on one virtual clock.
//!
//! [`SimWorld`] executes [`EngineAction`]s the way the production runtime
//! does, but synchronously: frames written by the engine are handed straight
//! to the [`SimServer`], server replies come back as [`LinkEvent`]s, and
//! timers fire only when the test advances the clock.

use std::{collections::VecDeque, time::Duration};

use parley_core::{Environment, PendingAction, SessionState};
use parley_proto::MessageId;
use parley_sync::{
    EngineAction, EngineConfig, EngineError, MemoryStore, MessageDraft, MessageStore, SyncEngine,
    SyncUpdate,
};

use crate::{
    SimEnv,
    invariants::{InvariantRegistry, Violation},
    sim_server::SimServer,
    sim_transport::{LinkEvent, SimTransport},
};

/// Endpoint used by simulated sessions.
pub const SIM_ENDPOINT: &str = "ws://sim.parley/ws";

/// Local user of simulated sessions.
pub const SIM_USER: &str = "me";

/// Upper bound on driver steps per call, so a livelock fails fast.
const MAX_STEPS: usize = 100_000;

/// One client, one link, one server.
pub struct SimWorld<S: MessageStore = MemoryStore> {
    /// Shared virtual environment
    pub env: SimEnv,
    /// Engine under test
    pub engine: SyncEngine<SimEnv, S>,
    /// Network link
    pub transport: SimTransport,
    /// Server model
    pub server: SimServer,
    updates: Vec<SyncUpdate>,
    opened_urls: Vec<String>,
}

impl SimWorld<MemoryStore> {
    /// Default engine over an in-memory store.
    pub fn new(seed: u64) -> Self {
        Self::with_store(seed, MemoryStore::new(), EngineConfig::new(SIM_ENDPOINT))
    }
}

impl<S: MessageStore> SimWorld<S> {
    /// Engine over `store` with `config`. The link and server derive their
    /// randomness from `seed` too.
    pub fn with_store(seed: u64, store: S, config: EngineConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let engine = SyncEngine::new(env.clone(), store, SIM_USER, config);
        Self {
            server: SimServer::new(env.clone(), SIM_USER),
            transport: SimTransport::with_seed(seed.wrapping_add(1)),
            env,
            engine,
            updates: Vec::new(),
            opened_urls: Vec::new(),
        }
    }

    /// Start a session and run until nothing is left to deliver.
    pub fn connect(&mut self, token: &str) -> Result<(), EngineError> {
        let actions = self.engine.connect(token, self.env.now())?;
        self.execute(actions);
        Ok(())
    }

    /// Intentional logout.
    pub fn disconnect(&mut self) {
        let actions = self.engine.disconnect(self.env.now());
        self.execute(actions);
    }

    /// Send a text message; returns its temp id.
    pub fn send_text(&mut self, conversation_id: &str, content: &str) -> Result<MessageId, EngineError> {
        let temp_id = self.engine.next_temp_id();
        let actions = self.engine.send_message(MessageDraft::text(conversation_id, content), temp_id.clone())?;
        self.execute(actions);
        Ok(temp_id)
    }

    /// Open a conversation.
    pub fn join(&mut self, conversation_id: &str) -> Result<(), EngineError> {
        let actions = self.engine.join_conversation(conversation_id)?;
        self.execute(actions);
        Ok(())
    }

    /// Retry a failed send.
    pub fn retry(&mut self, conversation_id: &str, message_id: &str) -> Result<(), EngineError> {
        let actions = self.engine.retry_message(conversation_id, message_id)?;
        self.execute(actions);
        Ok(())
    }

    /// Foreground / network regained.
    pub fn ensure_connected(&mut self) {
        let actions = self.engine.ensure_connected(self.env.now());
        self.execute(actions);
    }

    /// Push a server frame to the client, if connected.
    pub fn deliver(&mut self, frame: String) {
        self.transport.push(LinkEvent::Frame(frame));
        self.run_until_idle();
    }

    /// Break the current connection.
    pub fn sever(&mut self) {
        self.transport.sever();
        self.run_until_idle();
    }

    /// Advance virtual time by `total`, firing every timer that falls due.
    pub fn run_for(&mut self, total: Duration) {
        let end = self.env.elapsed().saturating_add(total);
        for _ in 0..MAX_STEPS {
            self.run_until_idle();
            let elapsed = self.env.elapsed();
            if elapsed >= end {
                return;
            }

            let remaining = end - elapsed;
            let step = self.engine.poll_timeout(self.env.now()).map_or(remaining, |wait| wait.min(remaining));
            self.env.advance(step);
            let actions = self.engine.tick(self.env.now());
            self.execute(actions);
        }
        tracing::warn!(?total, "run_for hit the step limit");
    }

    /// Deliver pending link events until the link is quiet.
    pub fn run_until_idle(&mut self) {
        for _ in 0..MAX_STEPS {
            let Some(event) = self.transport.next_event() else {
                return;
            };
            let now = self.env.now();
            let actions = match event {
                LinkEvent::Opened => {
                    self.server.connection_opened();
                    self.engine.transport_opened(now)
                },
                LinkEvent::Failed(error) => self.engine.transport_failed(&error, now),
                LinkEvent::Frame(text) => self.engine.handle_text(&text),
                LinkEvent::Pong => {
                    self.engine.pong_received(now);
                    Vec::new()
                },
                LinkEvent::Closed => self.engine.transport_closed(now),
            };
            self.apply(actions);
        }
        tracing::warn!("run_until_idle hit the step limit");
    }

    /// Execute engine actions in order, then drain the link.
    pub fn execute(&mut self, actions: Vec<EngineAction>) {
        self.apply(actions);
        self.run_until_idle();
    }

    fn apply(&mut self, actions: Vec<EngineAction>) {
        let mut work: VecDeque<EngineAction> = actions.into();

        while let Some(action) = work.pop_front() {
            match action {
                EngineAction::OpenTransport { url } => {
                    let authorized = self.server.accepts(&url);
                    self.opened_urls.push(url);
                    self.transport.open(authorized);
                },
                EngineAction::CloseTransport => {
                    self.transport.close();
                    if self.engine.session_state() == SessionState::Closing {
                        prepend(&mut work, self.engine.transport_closed(self.env.now()));
                    }
                },
                EngineAction::Transmit(pending) => self.transmit(pending, &mut work),
                EngineAction::SendPing => match self.transport.write() {
                    Ok(()) => self.transport.push(LinkEvent::Pong),
                    Err(error) => prepend(&mut work, self.engine.transport_failed(&error, self.env.now())),
                },
                EngineAction::Notify(update) => self.updates.push(update),
            }
        }
    }

    fn transmit(&mut self, pending: PendingAction, work: &mut VecDeque<EngineAction>) {
        if !self.transport.is_open() {
            let mut unsent = vec![pending];
            unsent.extend(take_transmits(work));
            self.engine.restore_unsent(unsent);
            return;
        }

        let Ok(text) = pending.envelope().encode() else {
            tracing::warn!(action = pending.action(), "dropping unencodable action");
            return;
        };

        if let Err(error) = self.transport.write() {
            self.engine.restore_unsent(take_transmits(work));
            prepend(work, self.engine.transmit_failed(pending, &error, self.env.now()));
            return;
        }

        for frame in self.server.handle_frame(&text) {
            self.transport.push(LinkEvent::Frame(frame));
        }
    }

    /// Updates published since the last call.
    pub fn take_updates(&mut self) -> Vec<SyncUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// URLs of every connection attempt
    pub fn opened_urls(&self) -> &[String] {
        &self.opened_urls
    }

    /// Run `registry` against the current state.
    pub fn check(&self, registry: &InvariantRegistry) -> Result<(), Vec<Violation>> {
        registry.check_all(self.engine.state())
    }
}

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
