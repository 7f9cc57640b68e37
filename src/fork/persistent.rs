//! The durable outbox fork.
//!
//! Saves enqueue into the queue store and wake the drain thread, which
//! sends batches to the remote. Retryable failures back off exponentially;
//! definitive rejections are dequeued, recorded, and never retried.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::error::{FactlineError, FactlineResult};
use crate::fact::{FactEnvelope, FactReference};
use crate::remote::RemoteEndpoint;

use super::queue::{Backoff, QueueStore};
use super::Fork;

/// Drain loop tuning.
#[derive(Debug, Clone)]
pub struct PersistentForkConfig {
    /// Envelopes per remote send.
    pub batch_limit: usize,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_cap: Duration,
}

impl Default for PersistentForkConfig {
    fn default() -> Self {
        Self {
            batch_limit: 20,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Durable outbox: write locally, enqueue, drain in the background.
pub struct PersistentFork {
    queue: Arc<dyn QueueStore>,
    // None after close; dropping the sender is the shutdown signal.
    wake_tx: Mutex<Option<Sender<()>>>,
    rejections: Arc<Mutex<Vec<FactlineError>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentFork {
    /// Starts the drain thread.
    #[must_use]
    pub fn new(
        queue: Arc<dyn QueueStore>,
        remote: Arc<dyn RemoteEndpoint>,
        cfg: PersistentForkConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let rejections = Arc::new(Mutex::new(Vec::new()));

        let thread_queue = Arc::clone(&queue);
        let thread_rejections = Arc::clone(&rejections);
        let join = thread::Builder::new()
            .name("factline-outbox".to_string())
            .spawn(move || drain_loop(thread_queue, remote, cfg, thread_rejections, wake_rx))
            .expect("failed to spawn factline outbox worker");

        Self {
            queue,
            wake_tx: Mutex::new(Some(wake_tx)),
            rejections,
            join: Mutex::new(Some(join)),
        }
    }

    /// Envelopes the remote definitively rejected; they are no longer
    /// queued. Draining the list clears it.
    pub fn take_rejections(&self) -> Vec<FactlineError> {
        self.rejections
            .lock()
            .map(|mut rejections| rejections.drain(..).collect())
            .unwrap_or_default()
    }

    /// Current outbox depth.
    pub fn pending(&self) -> usize {
        self.queue.len().unwrap_or(0)
    }
}

impl Fork for PersistentFork {
    fn save(&self, envelopes: &[FactEnvelope]) -> FactlineResult<()> {
        if envelopes.is_empty() {
            return Ok(());
        }
        self.queue.enqueue(envelopes).map_err(FactlineError::from)?;
        if let Ok(guard) = self.wake_tx.lock() {
            if let Some(wake_tx) = guard.as_ref() {
                match wake_tx.try_send(()) {
                    // Full means a wake-up is already pending.
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    // A disconnected drain loop means the fork is closing;
                    // the envelopes stay queued for the next process.
                    Err(TrySendError::Disconnected(())) => {}
                }
            }
        }
        Ok(())
    }

    fn close(&self) {
        // Dropping the wake sender disconnects the drain loop, which then
        // exits once the queue is idle.
        if let Ok(mut guard) = self.wake_tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PersistentFork {
    fn drop(&mut self) {
        self.close();
    }
}

fn batch_references(batch: &[FactEnvelope]) -> Vec<FactReference> {
    batch
        .iter()
        .filter_map(|envelope| envelope.reference().ok())
        .collect()
}

fn drain_loop(
    queue: Arc<dyn QueueStore>,
    remote: Arc<dyn RemoteEndpoint>,
    cfg: PersistentForkConfig,
    rejections: Arc<Mutex<Vec<FactlineError>>>,
    wake_rx: Receiver<()>,
) {
    let mut backoff = Backoff::new(cfg.backoff_base, cfg.backoff_cap);
    let mut closed = false;

    loop {
        let batch = match queue.peek(cfg.batch_limit.max(1)) {
            Ok(batch) => batch,
            Err(err) => {
                tracing::error!(%err, "outbox peek failed");
                Vec::new()
            }
        };

        if batch.is_empty() {
            if closed {
                break;
            }
            // Idle until the next save wakes us or the fork closes.
            match wake_rx.recv() {
                Ok(()) => continue,
                Err(_) => {
                    closed = true;
                    continue;
                }
            }
        }

        match remote.post_save(&batch) {
            Ok(()) => {
                if let Err(err) = queue.remove(&batch_references(&batch)) {
                    tracing::error!(%err, "outbox ack failed");
                }
                backoff.reset();
            }
            Err(err) if err.is_retryable() => {
                if closed {
                    // Leave the batch queued for the next process.
                    break;
                }
                let delay = backoff.next_delay();
                tracing::warn!(%err, delay_ms = delay.as_millis() as u64, "remote send failed; backing off");
                match wake_rx.recv_timeout(delay) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => closed = true,
                }
            }
            Err(err) => {
                // Definitive rejection (authorization or fatal status):
                // never retried, surfaced through take_rejections.
                tracing::error!(%err, "remote rejected batch; dropping from outbox");
                if let Err(remove_err) = queue.remove(&batch_references(&batch)) {
                    tracing::error!(%remove_err, "outbox reject removal failed");
                }
                if let Ok(mut list) = rejections.lock() {
                    list.push(err);
                }
            }
        }
    }
}
