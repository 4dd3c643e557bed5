//! Fault-injecting store wrapper
//!
//! Randomly fails operations of an inner store so tests can check that the
//! engine keeps serving from memory when the cache misbehaves.

use std::sync::{Arc, Mutex};

use parley_proto::{Conversation, Message};

use super::{Cursor, MessageStore, StorageError};

/// Store wrapper that fails operations with a fixed probability.
///
/// Failures are drawn from a seeded generator, so a seed reproduces the same
/// failure schedule. Clones share the generator.
#[derive(Clone)]
pub struct ChaoticStore<S: MessageStore> {
    inner: S,
    /// 0.0 never fails, 1.0 always fails
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    failures: Arc<Mutex<usize>>,
}

/// Linear congruential generator (Numerical Recipes constants).
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn next(&mut self) -> f64 {
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: MessageStore> ChaoticStore<S> {
    /// Wrap `inner`, failing each operation with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            failures: Arc::new(Mutex::new(0)),
        }
    }

    /// Underlying store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of injected failures so far.
    pub fn failures(&self) -> usize {
        self.failures.lock().map(|count| *count).unwrap_or(0)
    }

    fn roll(&self) -> Result<(), StorageError> {
        let fail = self
            .rng
            .lock()
            .map_err(|_| StorageError::Io("chaotic rng lock poisoned".to_string()))?
            .next()
            < self.failure_rate;

        if fail {
            if let Ok(mut count) = self.failures.lock() {
                *count += 1;
            }
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: MessageStore> MessageStore for ChaoticStore<S> {
    fn upsert_message(&self, message: &Message) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.upsert_message(message)
    }

    fn replace_message(
        &self,
        conversation_id: &str,
        old_id: &str,
        message: &Message,
    ) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.replace_message(conversation_id, old_id, message)
    }

    fn remove_message(&self, conversation_id: &str, message_id: &str) -> Result<bool, StorageError> {
        self.roll()?;
        self.inner.remove_message(conversation_id, message_id)
    }

    fn load_messages(
        &self,
        conversation_id: &str,
        after: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        self.roll()?;
        self.inner.load_messages(conversation_id, after, limit)
    }

    fn load_older(
        &self,
        conversation_id: &str,
        before: &Cursor,
        limit: usize,
    ) -> Result<Vec<Message>, StorageError> {
        self.roll()?;
        self.inner.load_older(conversation_id, before, limit)
    }

    fn message_count(&self, conversation_id: &str) -> Result<usize, StorageError> {
        self.roll()?;
        self.inner.message_count(conversation_id)
    }

    fn upsert_conversation(&self, conversation: &Conversation) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.upsert_conversation(conversation)
    }

    fn remove_conversation(&self, conversation_id: &str) -> Result<(), StorageError> {
        self.roll()?;
        self.inner.remove_conversation(conversation_id)
    }

    fn load_conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        self.roll()?;
        self.inner.load_conversations()
    }
}
