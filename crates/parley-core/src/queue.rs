//! Outgoing queue for actions issued while the transport is down.
//!
//! Actions are held in memory in FIFO order and flushed once per `Connected`
//! entry. Each hand-out counts as a send attempt; an action that keeps
//! failing is dropped after `max_retries` attempts and reported to the
//! caller so the owning message can be marked failed.

use std::collections::VecDeque;

use parley_proto::{Envelope, Outbound, Result as ProtoResult};

/// Send attempts allowed per action.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// An outbound envelope awaiting (re)transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    envelope: Envelope,
    retry_count: u32,
    replayable: bool,
}

impl PendingAction {
    /// Wrap an envelope. Non-replayable actions are never held in the queue.
    pub fn new(envelope: Envelope, replayable: bool) -> Self {
        Self { envelope, retry_count: 0, replayable }
    }

    /// Encode a typed action.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::JsonEncode` if the payload cannot be encoded
    pub fn from_outbound(outbound: Outbound) -> ProtoResult<Self> {
        let replayable = outbound.is_replayable();
        Ok(Self::new(outbound.into_envelope()?, replayable))
    }

    /// Envelope to transmit
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Send attempts so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether the action may be held for later
    pub fn is_replayable(&self) -> bool {
        self.replayable
    }

    /// Action string of the envelope
    pub fn action(&self) -> &str {
        self.envelope.action()
    }

    /// Temp id of the optimistic message this action sends, if any.
    pub fn temp_id(&self) -> Option<&str> {
        self.envelope.data_str("tempId")
    }

    /// Conversation the action targets, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        self.envelope.data_str("conversationId")
    }

    /// Record one send attempt.
    pub fn mark_attempt(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    fn unmark_attempt(&mut self) {
        self.retry_count = self.retry_count.saturating_sub(1);
    }
}

/// Result of [`OutgoingQueue::flush`].
#[derive(Debug, Default)]
pub struct Flush {
    /// Actions to transmit now, in FIFO order
    pub ready: Vec<PendingAction>,
    /// Actions that exceeded the retry budget
    pub dropped: Vec<PendingAction>,
}

/// FIFO of actions awaiting a connected transport.
#[derive(Debug, Clone)]
pub struct OutgoingQueue {
    pending: VecDeque<PendingAction>,
    max_retries: u32,
}

impl Default for OutgoingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl OutgoingQueue {
    /// Create an empty queue allowing `max_retries` attempts per action.
    pub fn new(max_retries: u32) -> Self {
        Self { pending: VecDeque::new(), max_retries }
    }

    /// Number of queued actions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queued actions in send order
    pub fn iter(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.iter()
    }

    /// Attempts allowed per action
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Hold an action until the next flush.
    ///
    /// Returns false (and discards the action) if it is not replayable.
    pub fn enqueue(&mut self, action: PendingAction) -> bool {
        if !action.replayable {
            tracing::debug!(action = action.action(), "not queueing ephemeral action");
            return false;
        }
        self.pending.push_back(action);
        true
    }

    /// Return an action whose send failed to the front of the queue. The
    /// attempt count is kept.
    ///
    /// Returns false if the action is not replayable.
    pub fn requeue(&mut self, action: PendingAction) -> bool {
        if !action.replayable {
            return false;
        }
        self.pending.push_front(action);
        true
    }

    /// Return actions handed out by [`OutgoingQueue::flush`] that were never
    /// attempted, undoing their attempt count. They go back to the front in
    /// their original order.
    pub fn restore(&mut self, actions: Vec<PendingAction>) {
        for mut action in actions.into_iter().rev() {
            action.unmark_attempt();
            self.pending.push_front(action);
        }
    }

    /// Drain the queue for transmission.
    ///
    /// Counts one attempt per action. Actions past the retry budget are
    /// returned in `dropped` and never handed out again.
    pub fn flush(&mut self) -> Flush {
        let mut flush = Flush::default();
        for mut action in self.pending.drain(..) {
            action.mark_attempt();
            if action.retry_count > self.max_retries {
                tracing::warn!(
                    action = action.action(),
                    attempts = action.retry_count - 1,
                    "dropping action after retry budget"
                );
                flush.dropped.push(action);
            } else {
                flush.ready.push(action);
            }
        }
        flush
    }

    /// Remove queued sends of the optimistic message `temp_id`, once the
    /// server has acknowledged it. Returns how many were removed.
    pub fn cancel(&mut self, temp_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|action| action.temp_id() != Some(temp_id));
        before - self.pending.len()
    }

    /// Whether a send of `temp_id` is waiting in the queue.
    pub fn contains_send(&self, temp_id: &str) -> bool {
        self.pending.iter().any(|action| action.temp_id() == Some(temp_id))
    }

    /// Drop everything. Returns what was queued.
    pub fn clear(&mut self) -> Vec<PendingAction> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn send(temp_id: &str) -> PendingAction {
        PendingAction::new(
            Envelope::new("message:send", json!({ "conversationId": "c1", "tempId": temp_id })),
            true,
        )
    }

    #[test]
    fn flush_is_fifo() {
        let mut queue = OutgoingQueue::default();
        for id in ["temp-1", "temp-2", "temp-3"] {
            queue.enqueue(send(id));
        }

        let flush = queue.flush();
        let ids: Vec<_> = flush.ready.iter().filter_map(PendingAction::temp_id).collect();
        assert_eq!(ids, ["temp-1", "temp-2", "temp-3"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn ephemeral_actions_are_not_held() {
        let mut queue = OutgoingQueue::default();
        let typing = PendingAction::new(Envelope::new("message:typing", json!({})), false);
        assert!(!queue.enqueue(typing));
        assert!(queue.is_empty());
    }

    #[test]
    fn restore_undoes_attempt_and_keeps_order() {
        let mut queue = OutgoingQueue::default();
        queue.enqueue(send("temp-1"));
        queue.enqueue(send("temp-2"));
        queue.enqueue(send("temp-3"));

        let mut flush = queue.flush();
        let unsent = flush.ready.split_off(1);
        queue.restore(unsent);

        let ids: Vec<_> = queue.iter().filter_map(PendingAction::temp_id).collect();
        assert_eq!(ids, ["temp-2", "temp-3"]);
        assert!(queue.iter().all(|a| a.retry_count() == 0));
    }

    #[test]
    fn requeue_goes_ahead_of_restored_actions() {
        let mut queue = OutgoingQueue::default();
        queue.enqueue(send("temp-1"));
        queue.enqueue(send("temp-2"));

        let mut flush = queue.flush();
        let unsent = flush.ready.split_off(1);
        let failed = flush.ready.remove(0);
        queue.restore(unsent);
        queue.requeue(failed);

        let ids: Vec<_> = queue.iter().filter_map(PendingAction::temp_id).collect();
        assert_eq!(ids, ["temp-1", "temp-2"]);
        let counts: Vec<_> = queue.iter().map(PendingAction::retry_count).collect();
        assert_eq!(counts, [1, 0]);
    }

    #[test]
    fn cancel_removes_only_matching_sends() {
        let mut queue = OutgoingQueue::default();
        queue.enqueue(send("temp-1"));
        queue.enqueue(send("temp-2"));

        assert_eq!(queue.cancel("temp-1"), 1);
        assert!(!queue.contains_send("temp-1"));
        assert!(queue.contains_send("temp-2"));
        assert_eq!(queue.cancel("temp-9"), 0);
    }

    #[test]
    fn clear_returns_everything() {
        let mut queue = OutgoingQueue::default();
        queue.enqueue(send("temp-1"));
        assert_eq!(queue.clear().len(), 1);
        assert!(queue.is_empty());
    }

    proptest! {
        /// However many times a send fails, it is attempted at most
        /// `max_retries` times and dropped exactly once.
        #[test]
        fn prop_failing_action_dropped_exactly_once(max_retries in 0u32..6, flushes in 1usize..12) {
            let mut queue = OutgoingQueue::new(max_retries);
            queue.enqueue(send("temp-1"));

            let mut attempts = 0u32;
            let mut drops = 0u32;
            for _ in 0..flushes {
                let flush = queue.flush();
                drops += u32::try_from(flush.dropped.len()).unwrap();
                for action in flush.ready {
                    attempts += 1;
                    queue.requeue(action);
                }
            }

            prop_assert!(attempts <= max_retries);
            let expected_drops = u32::from(flushes > usize::try_from(max_retries).unwrap());
            prop_assert_eq!(drops, expected_drops);
        }
    }
}
