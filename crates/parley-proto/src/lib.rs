//! Parley wire protocol
//!
//! JSON envelopes exchanged over a persistent duplex connection, and the data
//! model they carry.
//!
//! # Wire format
//!
//! Every frame is a single text frame holding an [`Envelope`]:
//!
//! ```text
//! {"action": "message:send", "data": {"conversationId": "c1", ...}}
//! ```
//!
//! The `action` string selects the payload type. Outbound payloads are built
//! from [`Outbound`], inbound frames are decoded into [`Inbound`]. Decoding is
//! per-frame: a malformed payload yields a [`ProtocolError`] for that frame
//! only, and unknown actions are reported separately so callers can ignore
//! them for forward compatibility.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod action;
pub mod envelope;
pub mod errors;
pub mod inbound;
pub mod model;
pub mod outbound;

pub use envelope::Envelope;
pub use errors::{ProtocolError, Result};
pub use inbound::Inbound;
pub use model::{
    Attachment, Conversation, ConversationId, ConversationKind, Message, MessageId, MessageKind,
    MessageStatus, Reactions, ReplyTo, TEMP_ID_PREFIX, UserId, UserPublic,
};
pub use outbound::Outbound;
