//! Parley protocol core
//!
//! Pure state machines for the client side of the sync protocol. Nothing in
//! this crate performs I/O: methods take the current time and an input, and
//! return actions for a driver to execute.
//!
//! - [`connection`]: session lifecycle, reconnect backoff, keepalive
//! - [`queue`]: outbound actions held while the transport is down
//! - [`env`]: time and randomness, swappable for simulation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod backoff;
pub mod connection;
pub mod env;
pub mod error;
pub mod queue;

pub use backoff::Backoff;
pub use connection::{
    Connection, ConnectionAction, ConnectionConfig, OfflineReason, SessionState,
};
pub use env::Environment;
pub use error::ConnectionError;
pub use queue::{Flush, OutgoingQueue, PendingAction};
