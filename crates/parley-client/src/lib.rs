//! Parley client runtime
//!
//! Drives the Sans-IO [`parley_sync::SyncEngine`] on Tokio:
//!
//! - [`transport`]: WebSocket connection with generation-tagged events
//! - [`runtime`]: the single task that owns the engine and the transport
//! - [`client`]: [`SyncClient`], the cloneable async handle, with `watch`
//!   and `broadcast` streams for observers
//! - [`config`]: TOML configuration
//! - [`system_env`]: production [`parley_core::Environment`]
//! - [`history`]: REST history seam

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod history;
pub mod runtime;
pub mod system_env;
pub mod transport;

pub use client::SyncClient;
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use history::{HistoryApi, HistoryError};
pub use runtime::{ActiveMessages, TypingMap};
pub use system_env::SystemEnv;
pub use transport::{Transport, TransportEvent};
