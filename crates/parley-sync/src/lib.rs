//! Parley sync layer
//!
//! Keeps the local view of conversations and messages consistent with the
//! server:
//!
//! - [`reconciler`]: pure `(state, event) -> changes` merge of server events,
//!   including optimistic-message replacement
//! - [`store`]: bounded on-disk message cache (memory and redb backends)
//! - [`engine`]: Sans-IO facade tying the connection, outgoing queue,
//!   reconciler and store together
//!
//! The engine performs no I/O. A driver executes the [`EngineAction`]s it
//! returns and reports transport outcomes back.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod engine;
pub mod error;
pub mod reconciler;
pub mod state;
pub mod store;

pub use engine::{Connectivity, EngineAction, EngineConfig, MessageDraft, SyncEngine, SyncUpdate};
pub use error::EngineError;
pub use reconciler::{Change, ReconcileContext};
pub use state::{ConversationList, MessageLog, SyncState};
pub use store::{Cursor, MemoryStore, MessageStore, RedbStore, StorageError};
