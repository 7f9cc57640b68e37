//! The write-path fork.
//!
//! The fork decides what happens to a batch after it is durable locally:
//! nothing (pass-through), an inline remote send (transient), or a durable
//! outbox drained by a background loop (persistent).

mod persistent;
/// Outbox queue contract and reference implementation.
pub mod queue;

use std::sync::Arc;

use crate::error::FactlineResult;
use crate::fact::FactEnvelope;
use crate::remote::RemoteEndpoint;

pub use persistent::{PersistentFork, PersistentForkConfig};
pub use queue::{Backoff, MemoryQueueStore, QueueStore};

/// Post-save handling of a durable batch.
pub trait Fork: Send + Sync {
    /// Accepts a batch that is already durable locally.
    fn save(&self, envelopes: &[FactEnvelope]) -> FactlineResult<()>;

    /// Shuts the fork down. Idempotent.
    fn close(&self);
}

/// Purely local: no remote, nothing to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughFork;

impl Fork for PassThroughFork {
    fn save(&self, _envelopes: &[FactEnvelope]) -> FactlineResult<()> {
        Ok(())
    }

    fn close(&self) {}
}

/// Sends inline with each save; failures surface to the caller.
pub struct TransientFork {
    remote: Arc<dyn RemoteEndpoint>,
}

impl TransientFork {
    /// Creates a transient fork over a remote.
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteEndpoint>) -> Self {
        Self { remote }
    }
}

impl Fork for TransientFork {
    fn save(&self, envelopes: &[FactEnvelope]) -> FactlineResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }
        self.remote.post_save(envelopes)
    }

    fn close(&self) {}
}
