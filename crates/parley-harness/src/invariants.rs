//! Properties of the local view that must hold after every step.
//!
//! Checks run against [`SyncState`] only, so they apply equally to a view
//! rebuilt from the cache and to one built live during a simulation.

use std::{collections::BTreeSet, fmt};

use parley_proto::{MessageStatus, model::is_temp_id};
use parley_sync::SyncState;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property checked against the local view.
pub trait Invariant: Send + Sync {
    /// Name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the property.
    fn check(&self, state: &SyncState) -> InvariantResult;
}

/// No message id appears twice in a conversation log.
pub struct UniqueMessageIds;

impl Invariant for UniqueMessageIds {
    fn name(&self) -> &'static str {
        "unique_message_ids"
    }

    fn check(&self, state: &SyncState) -> InvariantResult {
        for (conversation_id, log) in &state.messages {
            let mut seen = BTreeSet::new();
            for message in log.iter() {
                if !seen.insert(message.id.as_str()) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("conversation {conversation_id}: duplicate id {}", message.id),
                    });
                }
            }
        }
        Ok(())
    }
}

/// The conversation list is sorted by `updated_at`, newest first.
pub struct ConversationOrder;

impl Invariant for ConversationOrder {
    fn name(&self) -> &'static str {
        "conversation_order"
    }

    fn check(&self, state: &SyncState) -> InvariantResult {
        for pair in state.conversations.as_slice().windows(2) {
            if pair[0].updated_at < pair[1].updated_at {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{} ({}) listed before newer {} ({})",
                        pair[0].id, pair[0].updated_at, pair[1].id, pair[1].updated_at
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Only unconfirmed messages carry temp ids, and they are never shown as
/// confirmed.
pub struct ConfirmedHaveServerIds;

impl Invariant for ConfirmedHaveServerIds {
    fn name(&self) -> &'static str {
        "confirmed_have_server_ids"
    }

    fn check(&self, state: &SyncState) -> InvariantResult {
        let unconfirmed = |status| matches!(status, MessageStatus::Sending | MessageStatus::Failed);
        for log in state.messages.values() {
            for message in log.iter() {
                if is_temp_id(&message.id) != unconfirmed(message.status) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!("message {} has status {:?}", message.id, message.status),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Every check in this module.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(UniqueMessageIds);
        registry.add(ConversationOrder);
        registry.add(ConfirmedHaveServerIds);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every check, collecting all violations.
    pub fn check_all(&self, state: &SyncState) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> = self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use parley_proto::{Conversation, ConversationKind, Message, MessageKind, Reactions};

    use super::*;

    fn message(id: &str, status: MessageStatus) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            sender_id: "me".into(),
            original_content: "hi".into(),
            original_language: None,
            translated_content: None,
            target_language: None,
            kind: MessageKind::Text,
            status,
            created_at: Utc.timestamp_opt(1_704_067_200, 0).unwrap(),
            reactions: Reactions::new(),
            attachment: None,
            reply_to: None,
            deleted_at: None,
            deleted_by: None,
        }
    }

    fn conversation(id: &str, secs: i64) -> Conversation {
        let at = Utc.timestamp_opt(secs, 0).unwrap();
        Conversation {
            id: id.into(),
            kind: ConversationKind::Direct,
            name: None,
            participants: Vec::new(),
            last_message: None,
            created_at: at,
            updated_at: at,
            unread_count: 0,
        }
    }

    #[test]
    fn empty_state_passes() {
        let registry = InvariantRegistry::standard();
        assert_eq!(registry.len(), 3);
        assert!(registry.check_all(&SyncState::new("me")).is_ok());
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let mut state = SyncState::new("me");
        let log = state.log_mut("c1");
        log.push(message("srv-1", MessageStatus::Sent));
        log.push(message("srv-2", MessageStatus::Sent));
        let log = state.log_mut("c1");
        if let Some(second) = log.get_mut("srv-2") {
            second.id = "srv-1".into();
        }

        let violations = InvariantRegistry::standard().check_all(&state).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, "unique_message_ids");
    }

    #[test]
    fn misordered_list_is_reported() {
        let mut state = SyncState::new("me");
        state.conversations = parley_sync::ConversationList::from_unsorted(vec![conversation("c1", 10)]);
        state.conversations.upsert(conversation("c2", 20));
        assert!(ConversationOrder.check(&state).is_ok());

        if let Some(c1) = state.conversations.get_mut("c1") {
            c1.updated_at = Utc.timestamp_opt(30, 0).unwrap();
        }
        assert!(ConversationOrder.check(&state).is_err());
    }

    #[test]
    fn temp_id_marked_sent_is_reported() {
        let mut state = SyncState::new("me");
        state.log_mut("c1").push(message("temp-1-1", MessageStatus::Sent));
        assert!(ConfirmedHaveServerIds.check(&state).is_err());
    }
}
