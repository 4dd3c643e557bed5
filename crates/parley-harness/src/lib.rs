//! Deterministic simulation harness for the Parley sync engine.
//!
//! Runs a [`parley_sync::SyncEngine`] against an in-memory server over a
//! simulated link, all on one virtual clock. Every fault (unreachable
//! server, failed writes, severed connections, a flaky cache) is drawn from
//! a seed, so a failing run replays exactly.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties of the local view that must
//! hold after every step. Use [`InvariantRegistry::standard()`] for all of
//! them.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod invariants;
pub mod sim_env;
pub mod sim_server;
pub mod sim_transport;
pub mod world;

pub use invariants::{
    ConfirmedHaveServerIds, ConversationOrder, Invariant, InvariantRegistry, InvariantResult,
    UniqueMessageIds, Violation,
};
pub use sim_env::{SimEnv, SimInstant};
pub use sim_server::{SimServer, error_frame, typing_frame};
pub use sim_transport::{LinkEvent, SimTransport};
pub use world::{SIM_ENDPOINT, SIM_USER, SimWorld};
