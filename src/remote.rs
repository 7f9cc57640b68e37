//! The remote replica boundary.
//!
//! Everything the engine needs from a remote is captured by two small
//! traits: a request surface for saves and loads, and a pull-based feed
//! connection for streaming references. The HTTP client implements them
//! for real servers; tests implement them in-process.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FactlineResult;
use crate::fact::{FactEnvelope, FactReference};

/// Feed connections are force-recycled after this long to evade
/// intermediary timeouts; reconnection resumes from the last persisted
/// bookmark.
pub const FEED_RECYCLE_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// One event on a feed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// References newly matching the feed.
    pub references: Vec<FactReference>,
    /// Server-assigned resume position.
    pub bookmark: String,
}

/// A live feed connection. Dropping it closes the stream.
pub trait FeedConnection: Send {
    /// Blocks for the next event. `Ok(None)` signals an orderly close;
    /// the subscriber reopens from its last bookmark.
    fn next_event(&mut self) -> FactlineResult<Option<FeedEvent>>;
}

/// The wire surface of a remote replica.
pub trait RemoteEndpoint: Send + Sync {
    /// Publishes envelopes. Idempotent server-side: envelopes are
    /// content-addressed, so re-delivery is harmless.
    fn post_save(&self, envelopes: &[FactEnvelope]) -> FactlineResult<()>;

    /// Fetches the ancestor closure of the given references.
    fn post_load(&self, references: &[FactReference]) -> FactlineResult<Vec<FactEnvelope>>;

    /// Opens a feed stream past a bookmark. An empty bookmark starts from
    /// the beginning.
    fn open_feed(&self, feed: &str, bookmark: &str) -> FactlineResult<Box<dyn FeedConnection>>;
}

/// Supplies identity and credentials to the wire layer.
pub trait AuthenticationProvider: Send + Sync {
    /// The fact reference identifying the local user, if known.
    fn user_identity(&self) -> Option<FactReference> {
        None
    }

    /// Headers to attach to every request.
    fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Refreshes credentials after the server demands reauthentication.
    /// Returns true if the request should be retried.
    fn reauthenticate(&self) -> bool {
        false
    }
}

/// The no-op provider used when no authentication is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthenticationProvider;

impl AuthenticationProvider for NullAuthenticationProvider {}
