//! Remote feed subscriptions.
//!
//! A subscriber manages one feed stream for a `(feed, starting refs)`
//! identity. Observers share subscribers by refcount: the first acquisition
//! starts the stream, the last release stops it. The stream thread reads
//! events one at a time — the next event is not read until the previous
//! one's save has completed — deduplicates against storage, persists the
//! bookmark atomically with the save, and hands novel envelopes to the
//! injected notification callback.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};

use crate::error::{ExecutionError, FactlineError, FactlineResult};
use crate::fact::{FactEnvelope, FactReference};
use crate::fork::Backoff;
use crate::remote::{FeedEvent, RemoteEndpoint, FEED_RECYCLE_INTERVAL};
use crate::storage::{FeedDescriptor, Storage, StorageError};

/// Callback invoked with each batch of novel envelopes a feed delivers.
pub type FactsAddedCallback = Arc<dyn Fn(&[FactEnvelope]) + Send + Sync>;

/// A refcounted feed stream.
pub struct Subscriber {
    descriptor: FeedDescriptor,
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteEndpoint>,
    notify: FactsAddedCallback,
    refcount: Mutex<usize>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Creates a subscriber; nothing runs until `start`.
    #[must_use]
    pub fn new(
        descriptor: FeedDescriptor,
        storage: Arc<dyn Storage>,
        remote: Arc<dyn RemoteEndpoint>,
        notify: FactsAddedCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            storage,
            remote,
            notify,
            refcount: Mutex::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// The feed identity this subscriber serves.
    #[must_use]
    pub fn descriptor(&self) -> &FeedDescriptor {
        &self.descriptor
    }

    /// Takes a reference; true on the first acquisition, which obligates
    /// the caller to `start`.
    pub fn add_ref(&self) -> bool {
        let Ok(mut count) = self.refcount.lock() else {
            return false;
        };
        *count += 1;
        *count == 1
    }

    /// Drops a reference; true on the last release, which obligates the
    /// caller to `stop`.
    pub fn release(&self) -> bool {
        let Ok(mut count) = self.refcount.lock() else {
            return false;
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        *count == 0
    }

    /// Opens the stream. Returns after the first server response has been
    /// ingested, or with the first error, so callers can deterministically
    /// await first-data-or-failure.
    pub fn start(&self) -> FactlineResult<()> {
        let (ready_tx, ready_rx) = bounded::<FactlineResult<()>>(1);

        let descriptor = self.descriptor.clone();
        let storage = Arc::clone(&self.storage);
        let remote = Arc::clone(&self.remote);
        let notify = Arc::clone(&self.notify);
        let stopped = Arc::clone(&self.stopped);

        let handle = thread::Builder::new()
            .name(format!("factline-feed-{}", self.descriptor.name))
            .spawn(move || stream_loop(descriptor, storage, remote, notify, stopped, ready_tx))
            .map_err(|e| FactlineError::internal(format!("feed thread: {e}")))?;

        if let Ok(mut guard) = self.worker.lock() {
            *guard = Some(handle);
        }

        ready_rx.recv().map_err(|_| {
            FactlineError::Execution(ExecutionError::Disconnected {
                path: "feed_stream".to_string(),
            })
        })?
    }

    /// Stops the stream. No callback is invoked after this returns; the
    /// thread winds down at its next check.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // Detach rather than join: the thread may be blocked in a read
        // whose deadline is the recycle interval.
        if let Ok(mut guard) = self.worker.lock() {
            guard.take();
        }
    }
}

struct FirstResponse {
    tx: Option<Sender<FactlineResult<()>>>,
}

impl FirstResponse {
    fn report(&mut self, result: FactlineResult<()>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
    }

    const fn pending(&self) -> bool {
        self.tx.is_some()
    }
}

fn stream_loop(
    descriptor: FeedDescriptor,
    storage: Arc<dyn Storage>,
    remote: Arc<dyn RemoteEndpoint>,
    notify: FactsAddedCallback,
    stopped: Arc<AtomicBool>,
    ready_tx: Sender<FactlineResult<()>>,
) {
    let mut first = FirstResponse { tx: Some(ready_tx) };

    let mut bookmark = match storage.load_bookmark(&descriptor.name) {
        Ok(bookmark) => bookmark,
        Err(StorageError::BookmarkNotFound(_)) => String::new(),
        Err(err) => {
            first.report(Err(err.into()));
            return;
        }
    };

    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

    while !stopped.load(Ordering::Acquire) {
        let mut connection = match remote.open_feed(&descriptor.name, &bookmark) {
            Ok(connection) => connection,
            Err(err) => {
                if first.pending() {
                    first.report(Err(err));
                    return;
                }
                tracing::warn!(%err, feed = %descriptor.name, "feed open failed; backing off");
                thread::sleep(backoff.next_delay());
                continue;
            }
        };
        let opened = Instant::now();

        loop {
            if stopped.load(Ordering::Acquire) {
                return;
            }
            if opened.elapsed() >= FEED_RECYCLE_INTERVAL {
                tracing::debug!(feed = %descriptor.name, "recycling feed connection");
                break;
            }

            match connection.next_event() {
                Ok(Some(event)) => {
                    match ingest(&descriptor, &storage, &remote, &event) {
                        Ok(novel) => {
                            bookmark = event.bookmark.clone();
                            if !novel.is_empty() && !stopped.load(Ordering::Acquire) {
                                notify(&novel);
                            }
                            backoff.reset();
                            first.report(Ok(()));
                        }
                        Err(err) => {
                            if first.pending() {
                                first.report(Err(err));
                                return;
                            }
                            tracing::warn!(%err, feed = %descriptor.name, "feed ingest failed; reconnecting");
                            thread::sleep(backoff.next_delay());
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    if first.pending() {
                        first.report(Err(err));
                        return;
                    }
                    tracing::warn!(%err, feed = %descriptor.name, "feed read failed; reconnecting");
                    thread::sleep(backoff.next_delay());
                    break;
                }
            }
        }
    }
}

/// Deduplicates one event against storage, fetches unknown references in a
/// single batched load, and saves them atomically with the bookmark.
/// Returns the envelopes that were actually new.
fn ingest(
    descriptor: &FeedDescriptor,
    storage: &Arc<dyn Storage>,
    remote: &Arc<dyn RemoteEndpoint>,
    event: &FeedEvent,
) -> FactlineResult<Vec<FactEnvelope>> {
    let known: HashSet<String> = storage
        .which_exist(&event.references)
        .map_err(FactlineError::from)?
        .iter()
        .map(FactReference::key)
        .collect();
    let unknown: Vec<FactReference> = event
        .references
        .iter()
        .filter(|reference| !known.contains(&reference.key()))
        .cloned()
        .collect();

    let envelopes = if unknown.is_empty() {
        Vec::new()
    } else {
        remote.post_load(&unknown)?
    };

    storage
        .save_with_bookmark(&envelopes, &descriptor.name, &event.bookmark)
        .map_err(FactlineError::from)
}
