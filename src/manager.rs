//! The fact manager.
//!
//! Central coordinator composing storage, authorization, the fork, and the
//! observable source. The write path: hash and deduplicate, authorize each
//! novel fact against its evidence, save, notify observers, hand the batch
//! to the fork. The read path delegates to storage; the subscribe path
//! wires observers and refcounted feed subscribers together.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::authorization::{AuthorizationEngine, AuthorizationRules, EvidenceBundle};
use crate::error::{FactlineError, FactlineResult};
use crate::fact::{topological_order, Fact, FactEnvelope, FactReference};
use crate::fork::{Fork, PassThroughFork};
use crate::observable::{Observable, ObservableSource, ObservableSourceConfig, Observer, WatchHandlers};
use crate::query::{Projected, Specification, StepQuery};
use crate::remote::{AuthenticationProvider, NullAuthenticationProvider, RemoteEndpoint};
use crate::storage::{FeedDescriptor, LoginRecord, SpecificationResult, Storage};
use crate::subscriber::Subscriber;

/// Builder for [`FactManager`].
pub struct FactManagerBuilder {
    storage: Arc<dyn Storage>,
    fork: Option<Arc<dyn Fork>>,
    remote: Option<Arc<dyn RemoteEndpoint>>,
    authorization: Option<AuthorizationRules>,
    authentication: Option<Arc<dyn AuthenticationProvider>>,
    source_config: ObservableSourceConfig,
}

impl FactManagerBuilder {
    /// Sets the post-save fork. Defaults to pass-through.
    #[must_use]
    pub fn fork(mut self, fork: Arc<dyn Fork>) -> Self {
        self.fork = Some(fork);
        self
    }

    /// Sets the remote endpoint used by feed subscriptions.
    #[must_use]
    pub fn remote(mut self, remote: Arc<dyn RemoteEndpoint>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Enables authorization with the given rules.
    #[must_use]
    pub fn authorization(mut self, rules: AuthorizationRules) -> Self {
        self.authorization = Some(rules);
        self
    }

    /// Sets the authentication provider.
    #[must_use]
    pub fn authentication(mut self, provider: Arc<dyn AuthenticationProvider>) -> Self {
        self.authentication = Some(provider);
        self
    }

    /// Overrides dispatch fabric tuning.
    #[must_use]
    pub fn source_config(mut self, config: ObservableSourceConfig) -> Self {
        self.source_config = config;
        self
    }

    /// Builds the manager and starts its dispatch worker.
    #[must_use]
    pub fn build(self) -> Arc<FactManager> {
        let authorization = self
            .authorization
            .map(|rules| AuthorizationEngine::new(rules, Arc::clone(&self.storage)));
        Arc::new(FactManager {
            storage: self.storage,
            fork: self.fork.unwrap_or_else(|| Arc::new(PassThroughFork)),
            remote: self.remote,
            authorization,
            authentication: self
                .authentication
                .unwrap_or_else(|| Arc::new(NullAuthenticationProvider)),
            source: Arc::new(ObservableSource::new(self.source_config)),
            subscribers: Mutex::new(HashMap::new()),
        })
    }
}

/// The engine instance an application holds.
///
/// There is no global state; every subscriber, observer, and cache lives
/// inside this value.
pub struct FactManager {
    storage: Arc<dyn Storage>,
    fork: Arc<dyn Fork>,
    remote: Option<Arc<dyn RemoteEndpoint>>,
    authorization: Option<AuthorizationEngine>,
    authentication: Arc<dyn AuthenticationProvider>,
    source: Arc<ObservableSource>,
    subscribers: Mutex<HashMap<String, Arc<Subscriber>>>,
}

impl FactManager {
    /// Starts building a manager over a storage backend.
    #[must_use]
    pub fn builder(storage: Arc<dyn Storage>) -> FactManagerBuilder {
        FactManagerBuilder {
            storage,
            fork: None,
            remote: None,
            authorization: None,
            authentication: None,
            source_config: ObservableSourceConfig::default(),
        }
    }

    /// The shared storage handle.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The observable source driving observer dispatch.
    #[must_use]
    pub fn source(&self) -> &Arc<ObservableSource> {
        &self.source
    }

    /// Saves a graph of plain facts.
    pub fn save_facts(&self, facts: Vec<Fact>) -> FactlineResult<Vec<FactEnvelope>> {
        self.save(facts.into_iter().map(FactEnvelope::unsigned).collect())
    }

    /// Saves a graph of envelopes: orders topologically, deduplicates,
    /// authorizes each novel fact against the submitted evidence, persists,
    /// notifies observers, and enqueues for remote delivery.
    ///
    /// Returns the envelopes that were newly written. A batch is atomic
    /// with respect to observation: notification happens only after the
    /// whole batch is durable.
    pub fn save(&self, envelopes: Vec<FactEnvelope>) -> FactlineResult<Vec<FactEnvelope>> {
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }
        let ordered = topological_order(envelopes)?;

        let mut references = Vec::with_capacity(ordered.len());
        for envelope in &ordered {
            references.push(envelope.reference().map_err(FactlineError::from)?);
        }
        let existing: HashSet<String> = self
            .storage
            .which_exist(&references)
            .map_err(FactlineError::from)?
            .iter()
            .map(FactReference::key)
            .collect();

        let novel: Vec<FactEnvelope> = ordered
            .iter()
            .zip(&references)
            .filter(|(_, reference)| !existing.contains(&reference.key()))
            .map(|(envelope, _)| envelope.clone())
            .collect();
        if novel.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(authorization) = &self.authorization {
            let evidence = self.collect_evidence(&ordered, &references)?;
            let user = self.authentication.user_identity();
            for envelope in &novel {
                authorization.authorize(envelope, &evidence, user.as_ref())?;
            }
        }

        let saved = self.storage.save(&novel).map_err(FactlineError::from)?;
        self.source.notify(&saved);
        self.fork.save(&saved)?;
        Ok(saved)
    }

    /// Evidence for a submission: the batch itself, completed with any
    /// already-stored ancestors of predecessors the batch references but
    /// does not carry.
    fn collect_evidence(
        &self,
        ordered: &[FactEnvelope],
        references: &[FactReference],
    ) -> FactlineResult<EvidenceBundle> {
        let mut evidence =
            EvidenceBundle::from_envelopes(ordered).map_err(FactlineError::from)?;

        let in_batch: HashSet<String> = references.iter().map(FactReference::key).collect();
        let mut missing: Vec<FactReference> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for envelope in ordered {
            for predecessor in envelope.fact.predecessor_references() {
                let key = predecessor.key();
                if !in_batch.contains(&key) && seen.insert(key) {
                    missing.push(predecessor.clone());
                }
            }
        }
        if !missing.is_empty() {
            for envelope in self.storage.load(&missing).map_err(FactlineError::from)? {
                evidence.add(&envelope.fact).map_err(FactlineError::from)?;
            }
        }
        Ok(evidence)
    }

    /// Loads the ancestor closure of the given references.
    pub fn load(&self, references: &[FactReference]) -> FactlineResult<Vec<FactEnvelope>> {
        self.storage.load(references).map_err(FactlineError::from)
    }

    /// Executes a legacy step walk.
    pub fn query(
        &self,
        start: &FactReference,
        query: &StepQuery,
    ) -> FactlineResult<Vec<FactReference>> {
        self.storage.query(start, query).map_err(FactlineError::from)
    }

    /// Executes a specification, returning projections.
    pub fn read(
        &self,
        given: &[FactReference],
        specification: &Specification,
    ) -> FactlineResult<Vec<Projected>> {
        specification.validate()?;
        self.storage
            .read(given, specification)
            .map_err(FactlineError::from)
    }

    /// Executes a specification, returning bindings and projections.
    pub fn read_results(
        &self,
        given: &[FactReference],
        specification: &Specification,
    ) -> FactlineResult<Vec<SpecificationResult>> {
        specification.validate()?;
        self.storage
            .read_results(given, specification)
            .map_err(FactlineError::from)
    }

    /// Starts a live observer for a specification. The returned observer
    /// has already delivered its initial tuples.
    pub fn watch(
        &self,
        specification: Specification,
        given: Vec<FactReference>,
        handlers: Arc<WatchHandlers>,
    ) -> FactlineResult<Arc<Observer>> {
        let observer = Observer::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.source),
            specification,
            given,
            handlers,
        )?;
        observer.start()?;
        Ok(observer)
    }

    /// Opens a legacy query stream.
    pub fn observe_query(
        &self,
        start: FactReference,
        query: StepQuery,
    ) -> FactlineResult<Observable> {
        self.source
            .from_query(Arc::clone(&self.storage), start, query)
    }

    /// Acquires the shared subscriber for a feed, starting its stream on
    /// first acquisition. Novel inbound envelopes flow into the same
    /// dispatch fabric local saves use.
    pub fn subscribe(&self, descriptor: FeedDescriptor) -> FactlineResult<Arc<Subscriber>> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| FactlineError::internal("no remote endpoint configured"))?;

        let key = descriptor.key();
        let subscriber = {
            let mut subscribers = self
                .subscribers
                .lock()
                .map_err(|_| FactlineError::internal("subscriber registry lock poisoned"))?;
            Arc::clone(subscribers.entry(key.clone()).or_insert_with(|| {
                let source = Arc::clone(&self.source);
                Subscriber::new(
                    descriptor,
                    Arc::clone(&self.storage),
                    Arc::clone(remote),
                    Arc::new(move |envelopes| source.notify(envelopes)),
                )
            }))
        };

        if subscriber.add_ref() {
            if let Err(err) = subscriber.start() {
                subscriber.release();
                if let Ok(mut subscribers) = self.subscribers.lock() {
                    subscribers.remove(&key);
                }
                return Err(err);
            }
        }
        Ok(subscriber)
    }

    /// Releases a subscriber reference, stopping the stream on the last
    /// release.
    pub fn unsubscribe(&self, subscriber: &Arc<Subscriber>) {
        if subscriber.release() {
            subscriber.stop();
            if let Ok(mut subscribers) = self.subscribers.lock() {
                subscribers.remove(&subscriber.descriptor().key());
            }
        }
    }

    /// Looks up a session login.
    pub fn login(&self, session_token: &str) -> FactlineResult<Option<LoginRecord>> {
        self.storage
            .load_login(session_token)
            .map_err(FactlineError::from)
    }

    /// Records a session login.
    pub fn record_login(&self, session_token: &str, login: LoginRecord) -> FactlineResult<()> {
        self.storage
            .save_login(session_token, login)
            .map_err(FactlineError::from)
    }

    /// Shuts down the fork and every live subscriber.
    pub fn close(&self) {
        self.fork.close();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            for (_, subscriber) in subscribers.drain() {
                subscriber.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::DefaultPolicy;
    use crate::query::{Label, Match, MatchCondition, PathCondition, Projection, Role};
    use crate::storage::MemoryStore;

    fn manager() -> Arc<FactManager> {
        FactManager::builder(Arc::new(MemoryStore::new())).build()
    }

    fn chores_graph() -> (Fact, Fact) {
        let list = Fact::new("List").with_field("name", "Chores");
        let task = Fact::new("Task")
            .with_field("description", "trash")
            .with_predecessor("list", list.reference().unwrap());
        (list, task)
    }

    #[test]
    fn save_orders_and_deduplicates() {
        let manager = manager();
        let (list, task) = chores_graph();

        // Out of order on purpose; the manager sorts topologically.
        let saved = manager
            .save_facts(vec![task.clone(), list.clone()])
            .unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].fact.fact_type, "List");

        let again = manager.save_facts(vec![task, list]).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn save_enforces_authorization() {
        let alice = Fact::new("User").with_field("key", "alice");
        let spec = Specification::new(
            vec![Label::new("list", "List")],
            vec![Match::new(
                Label::new("owner", "User"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![],
                    label_right: "list".to_string(),
                    roles_right: vec![Role::new("owner", "User")],
                })],
            )],
            Projection::Label {
                label: "owner".to_string(),
            },
        );
        let rules = AuthorizationRules::new(DefaultPolicy::Permissive)
            .with_specification("List", spec)
            .unwrap();

        struct AliceProvider(FactReference);
        impl AuthenticationProvider for AliceProvider {
            fn user_identity(&self) -> Option<FactReference> {
                Some(self.0.clone())
            }
        }

        let manager = FactManager::builder(Arc::new(MemoryStore::new()))
            .authorization(rules)
            .authentication(Arc::new(AliceProvider(alice.reference().unwrap())))
            .build();

        let owned = Fact::new("List")
            .with_field("name", "Mine")
            .with_predecessor("owner", alice.reference().unwrap());
        manager
            .save_facts(vec![alice.clone(), owned])
            .unwrap();

        let bob = Fact::new("User").with_field("key", "bob");
        let theirs = Fact::new("List")
            .with_field("name", "Theirs")
            .with_predecessor("owner", bob.reference().unwrap());
        let err = manager.save_facts(vec![bob, theirs]).unwrap_err();
        assert!(err.is_forbidden());
    }

    #[test]
    fn evidence_is_completed_from_storage() {
        let alice = Fact::new("User").with_field("key", "alice");
        let spec = Specification::new(
            vec![Label::new("task", "Task")],
            vec![Match::new(
                Label::new("owner", "User"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![],
                    label_right: "task".to_string(),
                    roles_right: vec![Role::new("list", "List"), Role::new("owner", "User")],
                })],
            )],
            Projection::Label {
                label: "owner".to_string(),
            },
        );
        let rules = AuthorizationRules::new(DefaultPolicy::Permissive)
            .with_specification("Task", spec)
            .unwrap();

        struct AliceProvider(FactReference);
        impl AuthenticationProvider for AliceProvider {
            fn user_identity(&self) -> Option<FactReference> {
                Some(self.0.clone())
            }
        }

        let manager = FactManager::builder(Arc::new(MemoryStore::new()))
            .authorization(rules)
            .authentication(Arc::new(AliceProvider(alice.reference().unwrap())))
            .build();

        let list = Fact::new("List")
            .with_field("name", "Chores")
            .with_predecessor("owner", alice.reference().unwrap());
        manager
            .save_facts(vec![alice.clone(), list.clone()])
            .unwrap();

        // The task arrives without its predecessors; evidence is completed
        // from the stored closure.
        let task = Fact::new("Task")
            .with_field("description", "trash")
            .with_predecessor("list", list.reference().unwrap());
        manager.save_facts(vec![task]).unwrap();
    }

    #[test]
    fn subscribe_requires_a_remote() {
        let manager = manager();
        let descriptor = FeedDescriptor {
            name: "feed".to_string(),
            specification: Specification::new(
                vec![Label::new("list", "List")],
                vec![],
                Projection::Label {
                    label: "list".to_string(),
                },
            ),
            given: Vec::new(),
        };
        assert!(manager.subscribe(descriptor).is_err());
    }

    #[test]
    fn read_validates_the_specification_first() {
        let manager = manager();
        let malformed = Specification::new(
            vec![],
            vec![],
            Projection::Label {
                label: "x".to_string(),
            },
        );
        assert!(manager.read(&[], &malformed).unwrap_err().is_validation());
    }
}
