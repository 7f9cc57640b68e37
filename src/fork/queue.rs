//! The durable outbox contract.
//!
//! The queue is single-writer (the fork) and single-reader (the drain
//! loop). Entries are content-addressed envelopes, so enqueue is
//! idempotent and re-delivery after a crash is harmless. Durable backends
//! implement the same contract over their own transactions; the in-memory
//! store is the reference implementation and the test double.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::fact::{FactEnvelope, FactReference};
use crate::storage::StorageError;

/// Outbox queue contract.
pub trait QueueStore: Send + Sync {
    /// Appends envelopes not already queued.
    fn enqueue(&self, envelopes: &[FactEnvelope]) -> Result<(), StorageError>;

    /// Returns up to `limit` envelopes from the head without removing them.
    fn peek(&self, limit: usize) -> Result<Vec<FactEnvelope>, StorageError>;

    /// Removes acknowledged envelopes by reference.
    fn remove(&self, references: &[FactReference]) -> Result<(), StorageError>;

    /// Number of queued envelopes.
    fn len(&self) -> Result<usize, StorageError>;

    /// True when nothing is queued.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<(String, FactEnvelope)>,
    keys: HashSet<String>,
}

/// In-memory reference outbox.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    state: Mutex<QueueState>,
}

impl MemoryQueueStore {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

impl QueueStore for MemoryQueueStore {
    fn enqueue(&self, envelopes: &[FactEnvelope]) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err("queue.enqueue"))?;
        for envelope in envelopes {
            let key = envelope
                .reference()
                .map_err(|e| StorageError::Invalid(e.to_string()))?
                .key();
            if state.keys.insert(key.clone()) {
                state.entries.push((key, envelope.clone()));
            }
        }
        Ok(())
    }

    fn peek(&self, limit: usize) -> Result<Vec<FactEnvelope>, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("queue.peek"))?;
        Ok(state
            .entries
            .iter()
            .take(limit)
            .map(|(_, envelope)| envelope.clone())
            .collect())
    }

    fn remove(&self, references: &[FactReference]) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err("queue.remove"))?;
        let keys: HashSet<String> = references.iter().map(FactReference::key).collect();
        state.entries.retain(|(key, _)| !keys.contains(key));
        for key in keys {
            state.keys.remove(&key);
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("queue.len"))?;
        Ok(state.entries.len())
    }
}

/// Deterministic exponential backoff: doubles from a base up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl Backoff {
    /// A backoff doubling from `base` to at most `cap`.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: None,
        }
    }

    /// The next delay, doubling on each call.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(previous) => previous.saturating_mul(2).min(self.cap),
        };
        self.current = Some(next);
        next
    }

    /// Resets after a success.
    pub fn reset(&mut self) {
        self.current = None;
    }
}
