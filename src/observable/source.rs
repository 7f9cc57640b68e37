//! Save-notification dispatch.
//!
//! The source owns a dedicated worker thread. Saves enqueue the batch's
//! fact types on a bounded channel using non-blocking `try_send`, so local
//! writers never observe flow control. The worker walks registered
//! listeners and refreshes those whose specifications reference an
//! affected type. One worker means per-listener dispatch is serialized by
//! construction.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use uuid::Uuid;

use crate::error::{ExecutionError, FactlineError, FactlineResult};
use crate::fact::{FactEnvelope, FactReference};
use crate::query::StepQuery;
use crate::storage::Storage;

/// Dispatch fabric configuration.
#[derive(Debug, Clone)]
pub struct ObservableSourceConfig {
    /// Max queued save notifications before drops apply.
    pub notification_queue_capacity: usize,
    /// Max queued control messages (register/unregister).
    pub control_queue_capacity: usize,
    /// Per-stream buffer capacity for legacy query observables.
    pub stream_capacity: usize,
}

impl Default for ObservableSourceConfig {
    fn default() -> Self {
        Self {
            notification_queue_capacity: 4096,
            control_queue_capacity: 1024,
            stream_capacity: 1024,
        }
    }
}

/// A party interested in save notifications.
pub trait SourceListener: Send + Sync {
    /// Listener identity for unregistration.
    fn listener_id(&self) -> Uuid;

    /// Whether a batch touching these fact types can affect this listener.
    fn is_relevant(&self, fact_types: &HashSet<String>) -> bool;

    /// Re-evaluate against current storage and deliver deltas.
    fn refresh(&self);
}

pub(crate) enum ControlMsg {
    Register {
        listener: Arc<dyn SourceListener>,
        reply: Sender<()>,
    },
    Unregister {
        listener_id: Uuid,
    },
}

struct NotifyMsg {
    fact_types: HashSet<String>,
}

/// The per-process pub/sub fabric over the storage layer.
pub struct ObservableSource {
    cfg: ObservableSourceConfig,
    control_tx: Sender<ControlMsg>,
    notify_tx: Sender<NotifyMsg>,
    dropped_notifications: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ObservableSource {
    /// Starts the dispatch worker.
    #[must_use]
    pub fn new(cfg: ObservableSourceConfig) -> Self {
        let (control_tx, control_rx) =
            bounded::<ControlMsg>(cfg.control_queue_capacity.max(1));
        let (notify_tx, notify_rx) =
            bounded::<NotifyMsg>(cfg.notification_queue_capacity.max(1));

        let join = thread::Builder::new()
            .name("factline-dispatch".to_string())
            .spawn(move || worker_loop(control_rx, notify_rx))
            .expect("failed to spawn factline dispatch worker");

        Self {
            cfg,
            control_tx,
            notify_tx,
            dropped_notifications: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        }
    }

    /// Registers a listener, returning once the worker has admitted it.
    pub fn register(&self, listener: Arc<dyn SourceListener>) -> FactlineResult<()> {
        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.control_tx
            .send(ControlMsg::Register {
                listener,
                reply: reply_tx,
            })
            .map_err(|_| {
                FactlineError::Execution(ExecutionError::Disconnected {
                    path: "dispatch_control".to_string(),
                })
            })?;
        reply_rx.recv().map_err(|_| {
            FactlineError::Execution(ExecutionError::Disconnected {
                path: "dispatch_control".to_string(),
            })
        })
    }

    /// Registers without waiting for admission. For use on the dispatch
    /// worker itself, where waiting on the control reply would deadlock.
    pub(crate) fn register_nowait(&self, listener: Arc<dyn SourceListener>) {
        let (reply_tx, _reply_rx) = bounded::<()>(1);
        if self
            .control_tx
            .try_send(ControlMsg::Register {
                listener,
                reply: reply_tx,
            })
            .is_err()
        {
            tracing::error!("control queue full; nested listener registration dropped");
        }
    }

    /// Best-effort unregistration; idempotent.
    pub fn unregister(&self, listener_id: Uuid) {
        let _ = self.control_tx.try_send(ControlMsg::Unregister { listener_id });
    }

    /// Announces a durably saved batch. Non-blocking; a full queue drops
    /// the notification and bumps a counter, and the next notification
    /// heals any missed delta because listeners re-read storage.
    pub fn notify(&self, envelopes: &[FactEnvelope]) {
        if envelopes.is_empty() {
            return;
        }
        let fact_types: HashSet<String> = envelopes
            .iter()
            .map(|envelope| envelope.fact.fact_type.clone())
            .collect();
        match self.notify_tx.try_send(NotifyMsg { fact_types }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("dispatch queue full; save notification dropped");
            }
        }
    }

    /// Count of dropped notifications since start.
    #[must_use]
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    /// Opens a legacy query stream: new matches of `query` from `start`
    /// arrive as references on the returned observable.
    pub fn from_query(
        &self,
        storage: Arc<dyn Storage>,
        start: FactReference,
        query: StepQuery,
    ) -> FactlineResult<Observable> {
        let (stream_tx, stream_rx) = bounded::<FactReference>(self.cfg.stream_capacity.max(1));
        let listener = Arc::new(QueryListener {
            id: Uuid::new_v4(),
            storage,
            start,
            query,
            known: Mutex::new(HashSet::new()),
            tx: stream_tx,
        });

        let observable = Observable {
            listener_id: listener.id,
            rx: stream_rx,
            control_tx: self.control_tx.clone(),
            unregistered: AtomicBool::new(false),
        };

        self.register(listener.clone())?;
        // Seed with current matches so the stream starts complete.
        listener.refresh();
        Ok(observable)
    }
}

impl Drop for ObservableSource {
    fn drop(&mut self) {
        // Close channels so the worker can terminate. The worker is
        // detached rather than joined: observables keep control_tx clones
        // alive, and joining here could wait on a worker that never exits.
        let (dummy_control, _) = bounded::<ControlMsg>(1);
        drop(std::mem::replace(&mut self.control_tx, dummy_control));
        let (dummy_notify, _) = bounded::<NotifyMsg>(1);
        drop(std::mem::replace(&mut self.notify_tx, dummy_notify));

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                drop(handle);
            }
        }
    }
}

fn worker_loop(control_rx: Receiver<ControlMsg>, notify_rx: Receiver<NotifyMsg>) {
    let mut listeners: HashMap<Uuid, Arc<dyn SourceListener>> = HashMap::new();

    let mut control_closed = false;
    let mut notify_closed = false;

    loop {
        select! {
            recv(control_rx) -> msg => {
                match msg {
                    Ok(ControlMsg::Register { listener, reply }) => {
                        listeners.insert(listener.listener_id(), listener);
                        let _ = reply.send(());
                    }
                    Ok(ControlMsg::Unregister { listener_id }) => {
                        listeners.remove(&listener_id);
                    }
                    Err(_) => {
                        control_closed = true;
                    }
                }
            }
            recv(notify_rx) -> msg => {
                match msg {
                    Ok(NotifyMsg { fact_types }) => {
                        // Admit registrations enqueued before this batch so
                        // a fresh listener cannot miss it.
                        while let Ok(control) = control_rx.try_recv() {
                            match control {
                                ControlMsg::Register { listener, reply } => {
                                    listeners.insert(listener.listener_id(), listener);
                                    let _ = reply.send(());
                                }
                                ControlMsg::Unregister { listener_id } => {
                                    listeners.remove(&listener_id);
                                }
                            }
                        }
                        for listener in listeners.values() {
                            if listener.is_relevant(&fact_types) {
                                listener.refresh();
                            }
                        }
                    }
                    Err(_) => {
                        notify_closed = true;
                    }
                }
            }
            default(Duration::from_millis(50)) => {}
        }

        if control_closed && notify_closed {
            break;
        }
    }
}

/// A stream of references newly matching a legacy query.
///
/// Dropping the observable attempts best-effort unregistration.
pub struct Observable {
    listener_id: Uuid,
    rx: Receiver<FactReference>,
    control_tx: Sender<ControlMsg>,
    unregistered: AtomicBool,
}

impl Observable {
    /// Receives the next matching reference, blocking.
    pub fn recv(&self) -> FactlineResult<FactReference> {
        self.rx.recv().map_err(|_| {
            FactlineError::Execution(ExecutionError::Disconnected {
                path: "query_stream".to_string(),
            })
        })
    }

    /// Receives the next matching reference with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> FactlineResult<FactReference> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => FactlineError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => {
                FactlineError::Execution(ExecutionError::Disconnected {
                    path: "query_stream".to_string(),
                })
            }
        })
    }

    /// Best-effort explicit unregistration; non-blocking and idempotent.
    pub fn unsubscribe(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.control_tx.try_send(ControlMsg::Unregister {
            listener_id: self.listener_id,
        });
    }
}

impl Drop for Observable {
    fn drop(&mut self) {
        if !self.unregistered.swap(true, Ordering::AcqRel) {
            let _ = self.control_tx.try_send(ControlMsg::Unregister {
                listener_id: self.listener_id,
            });
        }
    }
}

struct QueryListener {
    id: Uuid,
    storage: Arc<dyn Storage>,
    start: FactReference,
    query: StepQuery,
    known: Mutex<HashSet<String>>,
    tx: Sender<FactReference>,
}

impl SourceListener for QueryListener {
    fn listener_id(&self) -> Uuid {
        self.id
    }

    fn is_relevant(&self, _fact_types: &HashSet<String>) -> bool {
        // Step queries do not declare their reachable types; refresh on
        // every save and let the known-set suppress duplicates.
        true
    }

    fn refresh(&self) {
        let Ok(matches) = self.storage.query(&self.start, &self.query) else {
            return;
        };
        let Ok(mut known) = self.known.lock() else {
            return;
        };
        for reference in matches {
            if known.insert(reference.key()) {
                // Never block the dispatch worker on a slow consumer.
                let _ = self.tx.try_send(reference);
            }
        }
    }
}
