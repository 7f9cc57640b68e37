//! Reactive observation over the storage layer.
//!
//! The observable source is a per-process pub/sub fabric: every successful
//! save is announced to a dispatcher worker, which drives re-evaluation of
//! the listeners whose specifications could be affected. Observers layer
//! add/remove callback semantics with exactly-once delivery on top.

/// Live specification subscriptions with add/remove callbacks.
pub mod observer;
/// Save-notification dispatch worker and legacy query streams.
pub mod source;

pub use observer::{AddedResponse, Observer, RemovalHandle, WatchHandlers};
pub use source::{Observable, ObservableSource, ObservableSourceConfig, SourceListener};
