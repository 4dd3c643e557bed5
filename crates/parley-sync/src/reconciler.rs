//! Merge server events and local operations into [`SyncState`].
//!
//! Every function here is a pure `(state, input) -> changes` step: it mutates
//! the in-memory state and reports what changed so the engine can persist the
//! affected rows and notify observers. Nothing here performs I/O.
//!
//! # Message receive
//!
//! An incoming `message:receive` is matched against the local log in order:
//!
//! 1. `tempId` present and found: replace that optimistic message in place
//! 2. own message without `tempId`: replace the oldest optimistic message with
//!    identical content created within the optimistic window of now
//! 3. server id already present: duplicate, discarded
//! 4. otherwise append
//!
//! Step 2 is a heuristic for servers that drop the `tempId` echo. Two
//! identical sends inside the window may be paired with the wrong copy; the
//! content is the same, so only the ids and timestamps can end up swapped.

use chrono::{DateTime, TimeDelta, Utc};
use parley_proto::{
    Conversation, ConversationId, ConversationKind, Inbound, Message, MessageId, MessageStatus,
    UserPublic,
    inbound::{
        ConversationCreated, MessageDeleted, MessageReceived, ParticipantsAdded,
        ParticipantsRemoved, ReactionUpdate, TypingEvent,
    },
};

use crate::state::SyncState;

/// Default window, in seconds, for matching an echo without `tempId` to an
/// optimistic message.
pub const DEFAULT_OPTIMISTIC_WINDOW_SECS: i64 = 30;

/// One unit of change produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Message inserted or updated in place (same id)
    MessageUpserted {
        /// Owning conversation
        conversation_id: ConversationId,
        /// Message id
        message_id: MessageId,
    },
    /// Optimistic message replaced by the server copy at the same position
    MessageReplaced {
        /// Owning conversation
        conversation_id: ConversationId,
        /// Temp id that was replaced
        old_id: MessageId,
        /// Server id now at that position
        new_id: MessageId,
    },
    /// Message removed from the local view
    MessageRemoved {
        /// Owning conversation
        conversation_id: ConversationId,
        /// Removed id
        message_id: MessageId,
    },
    /// Conversation inserted or updated
    ConversationUpserted {
        /// Conversation id
        conversation_id: ConversationId,
    },
    /// Conversation removed (local user left or was removed)
    ConversationRemoved {
        /// Conversation id
        conversation_id: ConversationId,
    },
    /// Conversation list order changed
    ConversationsReordered,
    /// Typing set of a conversation changed
    TypingChanged {
        /// Conversation id
        conversation_id: ConversationId,
    },
}

/// Inputs the reconciler needs besides the state and the event.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext {
    /// Current wall-clock time
    pub now: DateTime<Utc>,
    /// Window for the content-based optimistic match
    pub optimistic_window: TimeDelta,
}

impl ReconcileContext {
    /// Context at `now` with the default window
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now, optimistic_window: TimeDelta::seconds(DEFAULT_OPTIMISTIC_WINDOW_SECS) }
    }
}

/// Apply a server event.
pub fn reconcile(state: &mut SyncState, event: Inbound, ctx: &ReconcileContext) -> Vec<Change> {
    let mut changes = Vec::new();
    match event {
        Inbound::MessageReceived(event) => receive_message(state, event, ctx, &mut changes),
        Inbound::Typing(event) => typing(state, event, &mut changes),
        Inbound::Reaction(event) => reaction(state, event, &mut changes),
        Inbound::Deleted(event) => deleted(state, event, &mut changes),
        Inbound::ConversationCreated(ConversationCreated { conversation, .. }) => {
            upsert_conversation(state, conversation, &mut changes);
            reorder(state, &mut changes);
        },
        Inbound::ParticipantsAdded(event) => participants_added(state, event, ctx, &mut changes),
        Inbound::ParticipantsRemoved(event) => participants_removed(state, event, &mut changes),
        // Handled by the engine: connection-level concern
        Inbound::Error(_) => {},
    }
    changes
}

fn receive_message(
    state: &mut SyncState,
    event: MessageReceived,
    ctx: &ReconcileContext,
    changes: &mut Vec<Change>,
) {
    let MessageReceived { message, temp_id } = event;
    let conversation_id = message.conversation_id.clone();
    let from_self = message.sender_id == state.local_user_id;
    let log = state.log_mut(&conversation_id);

    let target = match temp_id.as_deref() {
        Some(temp_id) => log.position(temp_id),
        None if from_self => log.find_recent_optimistic(
            &message.sender_id,
            &message.original_content,
            ctx.now,
            ctx.optimistic_window,
        ),
        None => None,
    };

    let mut replaced = None;
    if let Some(position) = target {
        let old_id = log.at(position).map(|m| m.id.clone()).unwrap_or_default();

        if old_id != message.id && log.contains(&message.id) {
            // Server copy already arrived: drop the optimistic duplicate
            log.remove(&old_id);
            tracing::debug!(%old_id, new_id = %message.id, "optimistic copy superseded");
            changes.push(Change::MessageRemoved {
                conversation_id: conversation_id.clone(),
                message_id: old_id.clone(),
            });
            refresh_last_message(state, &conversation_id, Some(&old_id), changes);
            return;
        }

        log.replace_at(position, message.clone());
        changes.push(Change::MessageReplaced {
            conversation_id: conversation_id.clone(),
            old_id: old_id.clone(),
            new_id: message.id.clone(),
        });
        replaced = Some(old_id);
    } else if log.contains(&message.id) {
        tracing::debug!(id = %message.id, "duplicate message discarded");
        return;
    } else {
        log.push(message.clone());
        changes.push(Change::MessageUpserted {
            conversation_id: conversation_id.clone(),
            message_id: message.id.clone(),
        });
    }

    // A message from someone ends their typing indicator
    if let Some(typing) = state.typing.get_mut(&conversation_id)
        && typing.remove(&message.sender_id)
    {
        changes.push(Change::TypingChanged { conversation_id: conversation_id.clone() });
    }

    let unread = replaced.is_none() && !from_self && state.active.as_deref() != Some(&conversation_id);
    touch_conversation(state, &message, replaced.as_deref(), unread, changes);
}

/// Record `message` as activity in its conversation.
///
/// `lastMessage` only moves forward, and `updatedAt` is a monotonic max.
/// When the current `lastMessage` is the one being replaced, it is
/// recomputed from the log, since the server copy may carry an earlier
/// timestamp than other messages. Conversations unknown to the list are
/// materialized from the message.
fn touch_conversation(
    state: &mut SyncState,
    message: &Message,
    replaced_id: Option<&str>,
    unread: bool,
    changes: &mut Vec<Change>,
) {
    let conversation_id = &message.conversation_id;
    let newest = state.log(conversation_id).and_then(|log| log.newest()).cloned();

    match state.conversations.get_mut(conversation_id) {
        Some(conversation) => {
            let supersedes_last = conversation
                .last_message
                .as_ref()
                .is_some_and(|last| replaced_id.is_some_and(|old| old == last.id) || last.id == message.id);
            if supersedes_last {
                conversation.last_message = newest.or_else(|| Some(message.clone()));
            } else if conversation.last_message.as_ref().is_none_or(|last| message.created_at >= last.created_at) {
                conversation.last_message = Some(message.clone());
            }
            if message.created_at > conversation.updated_at {
                conversation.updated_at = message.created_at;
            }
            if unread {
                conversation.unread_count = conversation.unread_count.saturating_add(1);
            }
        },
        None => {
            tracing::debug!(%conversation_id, "materializing conversation from message");
            let mut participants = vec![UserPublic::placeholder(message.sender_id.clone())];
            if message.sender_id != state.local_user_id {
                participants.push(UserPublic::placeholder(state.local_user_id.clone()));
            }
            state.conversations.upsert(Conversation {
                id: conversation_id.clone(),
                kind: ConversationKind::Direct,
                name: None,
                participants,
                last_message: Some(message.clone()),
                created_at: message.created_at,
                updated_at: message.created_at,
                unread_count: u32::from(unread),
            });
        },
    }

    changes.push(Change::ConversationUpserted { conversation_id: conversation_id.clone() });
    reorder(state, changes);
}

/// Recompute `lastMessage` after `removed_id` left the log.
fn refresh_last_message(
    state: &mut SyncState,
    conversation_id: &str,
    removed_id: Option<&str>,
    changes: &mut Vec<Change>,
) {
    let newest = state.log(conversation_id).and_then(|log| log.newest()).cloned();
    let Some(conversation) = state.conversations.get_mut(conversation_id) else {
        return;
    };

    let stale = match (&conversation.last_message, removed_id) {
        (Some(last), Some(removed)) => last.id == removed,
        (None, _) | (_, None) => true,
    };
    if stale && conversation.last_message != newest {
        conversation.last_message = newest;
        changes.push(Change::ConversationUpserted { conversation_id: conversation_id.to_string() });
    }
}

/// Mirror an in-place message update into `lastMessage` if it is that message.
fn sync_last_message(state: &mut SyncState, conversation_id: &str, message_id: &str, changes: &mut Vec<Change>) {
    let Some(message) = state.log(conversation_id).and_then(|log| log.get(message_id)).cloned() else {
        return;
    };
    if let Some(conversation) = state.conversations.get_mut(conversation_id)
        && conversation.last_message.as_ref().is_some_and(|last| last.id == message_id)
    {
        conversation.last_message = Some(message);
        changes.push(Change::ConversationUpserted { conversation_id: conversation_id.to_string() });
    }
}

fn typing(state: &mut SyncState, event: TypingEvent, changes: &mut Vec<Change>) {
    if event.user_id == state.local_user_id {
        return;
    }

    let set = state.typing.entry(event.conversation_id.clone()).or_default();
    let changed = if event.is_typing { set.insert(event.user_id) } else { set.remove(&event.user_id) };
    if set.is_empty() {
        state.typing.remove(&event.conversation_id);
    }
    if changed {
        changes.push(Change::TypingChanged { conversation_id: event.conversation_id });
    }
}

fn reaction(state: &mut SyncState, event: ReactionUpdate, changes: &mut Vec<Change>) {
    let ReactionUpdate { conversation_id, message_id, reactions, .. } = event;
    let Some(message) = state.messages.get_mut(&conversation_id).and_then(|log| log.get_mut(&message_id)) else {
        tracing::debug!(%conversation_id, %message_id, "reaction for unknown message");
        return;
    };

    if message.reactions == reactions {
        return;
    }
    message.reactions = reactions;
    changes.push(Change::MessageUpserted { conversation_id: conversation_id.clone(), message_id: message_id.clone() });
    sync_last_message(state, &conversation_id, &message_id, changes);
}

fn deleted(state: &mut SyncState, event: MessageDeleted, changes: &mut Vec<Change>) {
    let MessageDeleted { conversation_id, message_id, deleted_by, deleted_at, for_everyone } = event;

    if for_everyone {
        let Some(message) = state.messages.get_mut(&conversation_id).and_then(|log| log.get_mut(&message_id)) else {
            tracing::debug!(%conversation_id, %message_id, "deletion for unknown message");
            return;
        };
        message.deleted_at = Some(deleted_at);
        message.deleted_by = Some(deleted_by);
        changes.push(Change::MessageUpserted { conversation_id: conversation_id.clone(), message_id: message_id.clone() });
        sync_last_message(state, &conversation_id, &message_id, changes);
    } else {
        let removed = state.messages.get_mut(&conversation_id).and_then(|log| log.remove(&message_id));
        if removed.is_none() {
            return;
        }
        changes.push(Change::MessageRemoved { conversation_id: conversation_id.clone(), message_id: message_id.clone() });
        refresh_last_message(state, &conversation_id, Some(&message_id), changes);
    }
}

fn participants_added(
    state: &mut SyncState,
    event: ParticipantsAdded,
    ctx: &ReconcileContext,
    changes: &mut Vec<Change>,
) {
    let ParticipantsAdded { conversation_id, added_user_ids, participants, .. } = event;

    // Profiles when the server sent them, placeholders otherwise
    let mut members = participants;
    for id in &added_user_ids {
        if !members.iter().any(|p| &p.id == id) {
            members.push(UserPublic::placeholder(id.clone()));
        }
    }

    match state.conversations.get_mut(&conversation_id) {
        Some(conversation) => {
            if conversation.add_participants(members) {
                changes.push(Change::ConversationUpserted { conversation_id });
            }
        },
        None if added_user_ids.contains(&state.local_user_id) => {
            tracing::info!(%conversation_id, "added to conversation");
            let mut conversation = Conversation {
                id: conversation_id.clone(),
                kind: ConversationKind::Group,
                name: None,
                participants: Vec::new(),
                last_message: None,
                created_at: ctx.now,
                updated_at: ctx.now,
                unread_count: 0,
            };
            conversation.add_participants(members);
            state.conversations.upsert(conversation);
            changes.push(Change::ConversationUpserted { conversation_id });
            reorder(state, changes);
        },
        None => {
            tracing::debug!(%conversation_id, "participants added to unknown conversation");
        },
    }
}

fn participants_removed(state: &mut SyncState, event: ParticipantsRemoved, changes: &mut Vec<Change>) {
    let ParticipantsRemoved { conversation_id, removed_user_ids, .. } = event;

    if removed_user_ids.contains(&state.local_user_id) {
        remove_conversation(state, &conversation_id, changes);
        return;
    }

    if let Some(conversation) = state.conversations.get_mut(&conversation_id)
        && conversation.remove_participants(&removed_user_ids)
    {
        changes.push(Change::ConversationUpserted { conversation_id: conversation_id.clone() });
    }

    if let Some(typing) = state.typing.get_mut(&conversation_id) {
        let before = typing.len();
        typing.retain(|user| !removed_user_ids.contains(user));
        if typing.len() != before {
            changes.push(Change::TypingChanged { conversation_id });
        }
    }
}

/// Drop a conversation and everything held for it.
pub fn remove_conversation(state: &mut SyncState, conversation_id: &str, changes: &mut Vec<Change>) {
    let existed = state.conversations.remove(conversation_id).is_some();
    state.messages.remove(conversation_id);
    state.typing.remove(conversation_id);
    if state.active.as_deref() == Some(conversation_id) {
        state.active = None;
    }
    if existed {
        changes.push(Change::ConversationRemoved { conversation_id: conversation_id.to_string() });
    }
}

/// Insert or update a conversation from an authoritative server copy.
///
/// Keeps the local `lastMessage` if it is newer, and never moves `updatedAt`
/// backwards.
fn upsert_conversation(state: &mut SyncState, incoming: Conversation, changes: &mut Vec<Change>) {
    let conversation_id = incoming.id.clone();
    let merged = match state.conversations.get(&conversation_id) {
        Some(existing) => {
            let mut merged = incoming;
            let keep_local = match (&existing.last_message, &merged.last_message) {
                (Some(local), Some(remote)) => local.created_at > remote.created_at,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if keep_local {
                merged.last_message.clone_from(&existing.last_message);
            }
            merged.updated_at = merged.updated_at.max(existing.updated_at);
            merged
        },
        None => incoming,
    };

    if state.conversations.get(&conversation_id) != Some(&merged) {
        state.conversations.upsert(merged);
        changes.push(Change::ConversationUpserted { conversation_id });
    }
}

fn reorder(state: &mut SyncState, changes: &mut Vec<Change>) {
    if state.conversations.sort() {
        changes.push(Change::ConversationsReordered);
    }
}

/// Append a locally composed message before it is sent.
pub fn append_optimistic(state: &mut SyncState, message: Message) -> Vec<Change> {
    let mut changes = Vec::new();
    let conversation_id = message.conversation_id.clone();
    if !state.log_mut(&conversation_id).push(message.clone()) {
        return changes;
    }
    changes.push(Change::MessageUpserted { conversation_id, message_id: message.id.clone() });
    touch_conversation(state, &message, None, false, &mut changes);
    changes
}

/// Set the status of a still-optimistic message.
///
/// Messages already acknowledged by the server are left alone, so a late
/// failure report cannot regress a delivered message.
pub fn set_optimistic_status(
    state: &mut SyncState,
    conversation_id: &str,
    message_id: &str,
    status: MessageStatus,
) -> Vec<Change> {
    let mut changes = Vec::new();
    let Some(message) = state.messages.get_mut(conversation_id).and_then(|log| log.get_mut(message_id)) else {
        return changes;
    };
    if !message.is_optimistic() || message.status == status {
        return changes;
    }

    message.status = status;
    changes.push(Change::MessageUpserted {
        conversation_id: conversation_id.to_string(),
        message_id: message_id.to_string(),
    });
    sync_last_message(state, conversation_id, message_id, &mut changes);
    changes
}

/// Mark an optimistic message as permanently failed.
pub fn mark_failed(state: &mut SyncState, conversation_id: &str, message_id: &str) -> Vec<Change> {
    set_optimistic_status(state, conversation_id, message_id, MessageStatus::Failed)
}

/// Put a failed optimistic message back into `sending` for a manual retry.
pub fn mark_sending(state: &mut SyncState, conversation_id: &str, message_id: &str) -> Vec<Change> {
    set_optimistic_status(state, conversation_id, message_id, MessageStatus::Sending)
}

/// Reset the unread counter of a conversation.
pub fn mark_read(state: &mut SyncState, conversation_id: &str) -> Vec<Change> {
    let mut changes = Vec::new();
    if let Some(conversation) = state.conversations.get_mut(conversation_id)
        && conversation.unread_count != 0
    {
        conversation.unread_count = 0;
        changes.push(Change::ConversationUpserted { conversation_id: conversation_id.to_string() });
    }
    changes
}

/// Merge a page of messages fetched out of band (REST history or the local
/// cache). Upsert by id; new ids are inserted in `createdAt` order.
pub fn merge_history(state: &mut SyncState, conversation_id: &str, page: Vec<Message>) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut newest: Option<Message> = None;

    for message in page {
        if message.conversation_id != conversation_id {
            tracing::debug!(id = %message.id, "history message for another conversation skipped");
            continue;
        }
        let log = state.log_mut(conversation_id);

        let changed = match log.position(&message.id) {
            Some(position) => {
                if log.at(position) == Some(&message) {
                    false
                } else {
                    log.replace_at(position, message.clone());
                    true
                }
            },
            None => log.insert_sorted(message.clone()),
        };

        if changed {
            changes.push(Change::MessageUpserted {
                conversation_id: conversation_id.to_string(),
                message_id: message.id.clone(),
            });
        }
        if newest.as_ref().is_none_or(|n| message.created_at >= n.created_at) {
            newest = Some(message);
        }
    }

    if let Some(newest) = newest
        && let Some(conversation) = state.conversations.get_mut(conversation_id)
    {
        let advance = conversation
            .last_message
            .as_ref()
            .is_none_or(|last| newest.created_at > last.created_at || last.id == newest.id);
        if advance && conversation.last_message.as_ref() != Some(&newest) {
            conversation.last_message = Some(newest);
            changes.push(Change::ConversationUpserted { conversation_id: conversation_id.to_string() });
        }
    }
    changes
}

/// Merge a conversation list fetched out of band.
pub fn merge_conversations(state: &mut SyncState, conversations: Vec<Conversation>) -> Vec<Change> {
    let mut changes = Vec::new();
    for conversation in conversations {
        upsert_conversation(state, conversation, &mut changes);
    }
    reorder(state, &mut changes);
    changes
}

#[cfg(test)]
mod tests {
    use parley_proto::{MessageKind, Reactions, inbound::ServerError};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn message(id: &str, sender: &str, content: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            conversation_id: "c1".into(),
            sender_id: sender.into(),
            original_content: content.into(),
            original_language: None,
            translated_content: None,
            target_language: None,
            kind: MessageKind::Text,
            status: MessageStatus::Sent,
            created_at: at(secs),
            reactions: Reactions::new(),
            attachment: None,
            reply_to: None,
            deleted_at: None,
            deleted_by: None,
        }
    }

    fn optimistic(id: &str, content: &str, secs: i64) -> Message {
        Message { status: MessageStatus::Sending, ..message(id, "me", content, secs) }
    }

    fn conversation(id: &str, secs: i64) -> Conversation {
        Conversation {
            id: id.into(),
            kind: ConversationKind::Direct,
            name: None,
            participants: vec![UserPublic::placeholder("me"), UserPublic::placeholder("bob")],
            last_message: None,
            created_at: at(0),
            updated_at: at(secs),
            unread_count: 0,
        }
    }

    fn state() -> SyncState {
        let mut state = SyncState::new("me");
        merge_conversations(&mut state, vec![conversation("c1", 0), conversation("c2", 5)]);
        state
    }

    fn receive(message: Message, temp_id: Option<&str>) -> Inbound {
        Inbound::MessageReceived(MessageReceived { message, temp_id: temp_id.map(str::to_string) })
    }

    fn ids(state: &SyncState) -> Vec<String> {
        state.log("c1").map(|log| log.iter().map(|m| m.id.clone()).collect()).unwrap_or_default()
    }

    #[test]
    fn temp_id_echo_replaces_in_place() {
        let mut state = state();
        append_optimistic(&mut state, optimistic("temp-1", "hi", 10));
        reconcile(&mut state, receive(message("srv-0", "bob", "yo", 11), None), &ReconcileContext::at(at(11)));

        let changes = reconcile(
            &mut state,
            receive(message("srv-9", "me", "hi", 12), Some("temp-1")),
            &ReconcileContext::at(at(12)),
        );

        assert_eq!(ids(&state), ["srv-9", "srv-0"]);
        assert!(changes.contains(&Change::MessageReplaced {
            conversation_id: "c1".into(),
            old_id: "temp-1".into(),
            new_id: "srv-9".into(),
        }));
        assert_eq!(state.log("c1").unwrap().get("srv-9").unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn same_event_twice_is_stored_once() {
        let mut state = state();
        let ctx = ReconcileContext::at(at(10));
        reconcile(&mut state, receive(message("srv-1", "bob", "hola", 10), None), &ctx);
        let again = reconcile(&mut state, receive(message("srv-1", "bob", "hola", 10), None), &ctx);

        assert!(again.is_empty());
        assert_eq!(ids(&state), ["srv-1"]);
    }

    #[test]
    fn own_echo_without_temp_id_matches_recent_optimistic() {
        let mut state = state();
        append_optimistic(&mut state, optimistic("temp-1", "hi", 100));

        reconcile(&mut state, receive(message("srv-9", "me", "hi", 101), None), &ReconcileContext::at(at(110)));

        assert_eq!(ids(&state), ["srv-9"]);
    }

    #[test]
    fn stale_optimistic_is_not_matched() {
        let mut state = state();
        append_optimistic(&mut state, optimistic("temp-1", "hi", 100));

        reconcile(&mut state, receive(message("srv-9", "me", "hi", 160), None), &ReconcileContext::at(at(160)));

        assert_eq!(ids(&state), ["temp-1", "srv-9"]);
    }

    #[test]
    fn replacement_never_duplicates_server_id() {
        let mut state = state();
        append_optimistic(&mut state, optimistic("temp-1", "hi", 10));
        let ctx = ReconcileContext::at(at(11));
        // Echo without temp id arrives first and is appended (other content)
        reconcile(&mut state, receive(message("srv-9", "me", "hi!", 11), None), &ctx);
        // Then the tempId acknowledgement for the same server id
        reconcile(&mut state, receive(message("srv-9", "me", "hi!", 11), Some("temp-1")), &ctx);

        assert_eq!(ids(&state), ["srv-9"]);
    }

    #[test]
    fn last_message_only_moves_forward_and_list_reorders() {
        let mut state = state();
        assert_eq!(state.conversations.as_slice()[0].id, "c2");

        let changes = reconcile(&mut state, receive(message("srv-2", "bob", "new", 20), None), &ReconcileContext::at(at(20)));
        assert!(changes.contains(&Change::ConversationsReordered));
        assert_eq!(state.conversations.as_slice()[0].id, "c1");

        reconcile(&mut state, receive(message("srv-1", "bob", "old", 15), None), &ReconcileContext::at(at(21)));
        let c1 = state.conversations.get("c1").unwrap();
        assert_eq!(c1.last_message.as_ref().unwrap().id, "srv-2");
        assert_eq!(c1.updated_at, at(20));
    }

    #[test]
    fn earlier_stamped_echo_of_last_message_yields_to_newer_message() {
        let mut state = state();
        append_optimistic(&mut state, optimistic("temp-1", "hi", 100));
        reconcile(&mut state, receive(message("srv-bob", "bob", "yo", 98), None), &ReconcileContext::at(at(100)));
        assert_eq!(state.conversations.get("c1").unwrap().last_message.as_ref().unwrap().id, "temp-1");

        reconcile(
            &mut state,
            receive(message("srv-me", "me", "hi", 97), Some("temp-1")),
            &ReconcileContext::at(at(101)),
        );

        assert_eq!(ids(&state), ["srv-me", "srv-bob"]);
        let last = state.conversations.get("c1").unwrap().last_message.clone().unwrap();
        assert_eq!(last.id, "srv-bob");
        assert_eq!(last.created_at, at(98));
    }

    #[test]
    fn echo_of_sole_message_becomes_last_message() {
        let mut state = state();
        append_optimistic(&mut state, optimistic("temp-1", "hi", 100));

        reconcile(
            &mut state,
            receive(message("srv-me", "me", "hi", 97), Some("temp-1")),
            &ReconcileContext::at(at(101)),
        );

        let last = state.conversations.get("c1").unwrap().last_message.clone().unwrap();
        assert_eq!(last.id, "srv-me");
        assert_eq!(last.status, MessageStatus::Sent);
    }

    #[test]
    fn unread_counts_only_others_in_inactive_conversations() {
        let mut state = state();
        let ctx = ReconcileContext::at(at(10));
        reconcile(&mut state, receive(message("a", "bob", "1", 10), None), &ctx);
        append_optimistic(&mut state, optimistic("temp-x", "mine", 11));
        assert_eq!(state.conversations.get("c1").unwrap().unread_count, 1);

        state.active = Some("c1".into());
        reconcile(&mut state, receive(message("b", "bob", "2", 12), None), &ctx);
        assert_eq!(state.conversations.get("c1").unwrap().unread_count, 1);

        mark_read(&mut state, "c1");
        assert_eq!(state.conversations.get("c1").unwrap().unread_count, 0);
    }

    #[test]
    fn typing_ignores_own_echo_and_clears_on_message() {
        let mut state = state();
        let typing = |user: &str, on: bool| {
            Inbound::Typing(TypingEvent { conversation_id: "c1".into(), user_id: user.into(), is_typing: on })
        };
        let ctx = ReconcileContext::at(at(0));

        assert!(reconcile(&mut state, typing("me", true), &ctx).is_empty());
        assert_eq!(reconcile(&mut state, typing("bob", true), &ctx).len(), 1);
        assert!(state.typing_in("c1").contains("bob"));

        reconcile(&mut state, receive(message("m", "bob", "x", 1), None), &ctx);
        assert!(state.typing_in("c1").is_empty());
    }

    #[test]
    fn reaction_replaces_map() {
        let mut state = state();
        let ctx = ReconcileContext::at(at(0));
        reconcile(&mut state, receive(message("m1", "bob", "x", 1), None), &ctx);

        let mut reactions = Reactions::new();
        reactions.entry("👍".into()).or_default().insert("me".into());
        reconcile(
            &mut state,
            Inbound::Reaction(ReactionUpdate {
                conversation_id: "c1".into(),
                message_id: "m1".into(),
                message_timestamp: Some(at(1)),
                reactions: reactions.clone(),
                user_id: Some("me".into()),
                emoji: Some("👍".into()),
            }),
            &ctx,
        );

        assert_eq!(state.log("c1").unwrap().get("m1").unwrap().reactions, reactions);
        assert_eq!(state.conversations.get("c1").unwrap().last_message.as_ref().unwrap().reactions, reactions);
    }

    #[test]
    fn delete_for_everyone_tombstones_and_local_delete_removes() {
        let mut state = state();
        let ctx = ReconcileContext::at(at(0));
        reconcile(&mut state, receive(message("m1", "bob", "a", 1), None), &ctx);
        reconcile(&mut state, receive(message("m2", "bob", "b", 2), None), &ctx);

        let delete = |id: &str, everyone| {
            Inbound::Deleted(MessageDeleted {
                conversation_id: "c1".into(),
                message_id: id.into(),
                deleted_by: "bob".into(),
                deleted_at: at(3),
                for_everyone: everyone,
            })
        };

        reconcile(&mut state, delete("m1", true), &ctx);
        assert!(state.log("c1").unwrap().get("m1").unwrap().is_deleted());

        reconcile(&mut state, delete("m2", false), &ctx);
        assert_eq!(ids(&state), ["m1"]);
        assert_eq!(state.conversations.get("c1").unwrap().last_message.as_ref().unwrap().id, "m1");
    }

    #[test]
    fn added_to_unknown_conversation_materializes_it() {
        let mut state = state();
        let changes = reconcile(
            &mut state,
            Inbound::ParticipantsAdded(ParticipantsAdded {
                conversation_id: "g1".into(),
                added_user_ids: vec!["me".into()],
                added_by: Some("bob".into()),
                participants: vec![UserPublic::placeholder("bob")],
            }),
            &ReconcileContext::at(at(50)),
        );

        let g1 = state.conversations.get("g1").unwrap();
        assert_eq!(g1.kind, ConversationKind::Group);
        assert!(g1.has_participant("me") && g1.has_participant("bob"));
        assert_eq!(state.conversations.as_slice()[0].id, "g1");
        assert!(changes.contains(&Change::ConversationUpserted { conversation_id: "g1".into() }));
    }

    #[test]
    fn removal_of_local_user_drops_conversation() {
        let mut state = state();
        let changes = reconcile(
            &mut state,
            Inbound::ParticipantsRemoved(ParticipantsRemoved {
                conversation_id: "c1".into(),
                removed_user_ids: vec!["me".into()],
                removed_by: None,
            }),
            &ReconcileContext::at(at(0)),
        );

        assert!(state.conversations.get("c1").is_none());
        assert_eq!(changes, vec![Change::ConversationRemoved { conversation_id: "c1".into() }]);
    }

    #[test]
    fn failed_status_never_overrides_acknowledged_message() {
        let mut state = state();
        append_optimistic(&mut state, optimistic("temp-1", "hi", 10));
        reconcile(&mut state, receive(message("srv-1", "me", "hi", 10), Some("temp-1")), &ReconcileContext::at(at(10)));

        assert!(mark_failed(&mut state, "c1", "srv-1").is_empty());
        assert!(mark_failed(&mut state, "c1", "temp-1").is_empty());
    }

    #[test]
    fn history_merge_upserts_and_sorts() {
        let mut state = state();
        reconcile(&mut state, receive(message("m3", "bob", "c", 30), None), &ReconcileContext::at(at(30)));

        merge_history(&mut state, "c1", vec![message("m1", "bob", "a", 10), message("m2", "bob", "b", 20), message("m3", "bob", "c", 30)]);

        assert_eq!(ids(&state), ["m1", "m2", "m3"]);
        assert_eq!(state.conversations.get("c1").unwrap().last_message.as_ref().unwrap().id, "m3");
    }

    #[test]
    fn error_event_changes_nothing() {
        let mut state = state();
        let event = Inbound::Error(ServerError { code: serde_json::json!("rate_limited"), message: String::new() });
        assert!(reconcile(&mut state, event, &ReconcileContext::at(at(0))).is_empty());
    }
}
