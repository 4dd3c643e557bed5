//! Action strings used in the envelope `action` field.

/// Client sends a chat message.
pub const MESSAGE_SEND: &str = "message:send";

/// Server delivers a message (new, or the echo of one we sent).
pub const MESSAGE_RECEIVE: &str = "message:receive";

/// Typing indicator, both directions.
pub const MESSAGE_TYPING: &str = "message:typing";

/// Client marks a message as read.
pub const MESSAGE_READ: &str = "message:read";

/// Reaction toggle (outbound) or reaction map update (inbound).
pub const MESSAGE_REACTION: &str = "message:reaction";

/// Server reports a deleted message.
pub const MESSAGE_DELETED: &str = "message:deleted";

/// Client subscribes to a conversation's events.
pub const CONVERSATION_JOIN: &str = "conversation:join";

/// Client unsubscribes from a conversation's events.
pub const CONVERSATION_LEAVE: &str = "conversation:leave";

/// Server reports a new conversation.
pub const CONVERSATION_CREATED: &str = "conversation:created";

/// Server reports members added to a conversation.
pub const PARTICIPANTS_ADDED: &str = "conversation:participants:added";

/// Server reports members removed from a conversation.
pub const PARTICIPANTS_REMOVED: &str = "conversation:participants:removed";

/// Server-side error notification.
pub const ERROR: &str = "error";
