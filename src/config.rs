//! Engine configuration.
//!
//! A configuration describes the instance an application wants: where the
//! remote lives (absence means local-only), how the outbox behaves, and
//! which providers supply credentials and rules.

use std::sync::Arc;
use std::time::Duration;

use crate::authorization::AuthorizationRules;
use crate::error::FactlineResult;
use crate::fork::{
    Fork, MemoryQueueStore, PassThroughFork, PersistentFork, PersistentForkConfig, QueueStore,
    TransientFork,
};
use crate::http::WebClient;
use crate::manager::FactManager;
use crate::remote::{AuthenticationProvider, NullAuthenticationProvider, RemoteEndpoint};
use crate::storage::Storage;

/// Configuration for a factline instance.
pub struct FactlineConfig {
    /// Base URL of the remote replica; absence means local-only.
    pub http_endpoint: Option<String>,

    /// Request timeout.
    pub http_timeout: Duration,

    /// Reserved. The feed protocol streams over HTTP; this endpoint is
    /// accepted for forward compatibility and not used.
    pub ws_endpoint: Option<String>,

    /// Durable outbox (true) or inline sends that surface failures (false).
    pub persistent_outbox: bool,

    /// Outbox backend; defaults to the in-memory queue.
    pub queue: Option<Arc<dyn QueueStore>>,

    /// Credentials and identity injection.
    pub authentication: Option<Arc<dyn AuthenticationProvider>>,

    /// Per-type authorization rules; absence disables authorization.
    pub authorization: Option<AuthorizationRules>,
}

impl Default for FactlineConfig {
    fn default() -> Self {
        Self {
            http_endpoint: None,
            http_timeout: Duration::from_secs(30),
            ws_endpoint: None,
            persistent_outbox: true,
            queue: None,
            authentication: None,
            authorization: None,
        }
    }
}

impl FactlineConfig {
    /// Builds a manager over the given storage.
    pub fn create_manager(self, storage: Arc<dyn Storage>) -> FactlineResult<Arc<FactManager>> {
        let authentication: Arc<dyn AuthenticationProvider> = self
            .authentication
            .unwrap_or_else(|| Arc::new(NullAuthenticationProvider));

        let mut builder =
            FactManager::builder(Arc::clone(&storage)).authentication(Arc::clone(&authentication));

        if let Some(rules) = self.authorization {
            builder = builder.authorization(rules);
        }

        if let Some(endpoint) = self.http_endpoint {
            let remote: Arc<dyn RemoteEndpoint> = Arc::new(WebClient::new(
                endpoint,
                self.http_timeout,
                Arc::clone(&authentication),
            )?);

            let fork: Arc<dyn Fork> = if self.persistent_outbox {
                let queue = self
                    .queue
                    .unwrap_or_else(|| Arc::new(MemoryQueueStore::new()));
                Arc::new(PersistentFork::new(
                    queue,
                    Arc::clone(&remote),
                    PersistentForkConfig::default(),
                ))
            } else {
                Arc::new(TransientFork::new(Arc::clone(&remote)))
            };

            builder = builder.remote(remote).fork(fork);
        } else {
            builder = builder.fork(Arc::new(PassThroughFork));
        }

        Ok(builder.build())
    }
}
