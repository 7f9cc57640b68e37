//! Live specification subscriptions.
//!
//! An observer runs a specification against current storage, invokes the
//! `added` callback for every initial tuple, then re-evaluates on each save
//! notification and delivers deltas. `added` fires exactly once per tuple
//! per observer lifetime; `removed` fires at most once, only after a prior
//! `added`, and only when an existential flip invalidates the tuple —
//! facts are immutable, so nothing else can take a tuple away.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::{ExecutionError, FactlineError, FactlineResult};
use crate::fact::FactReference;
use crate::observable::source::{ObservableSource, SourceListener};
use crate::query::{Projected, Projection, Specification};
use crate::storage::{SpecificationResult, Storage};

/// Teardown for user state attached to an added tuple. Invoked when the
/// tuple is removed by an existential flip; dropped without invocation when
/// the observer stops.
pub type RemovalHandle = Box<dyn FnOnce() + Send>;

/// What an `added` callback hands back to the observer.
pub struct AddedResponse {
    /// Invoked if this tuple is later removed.
    pub on_removed: Option<RemovalHandle>,
    /// Handlers for nested sub-collections, keyed by the record component
    /// name carrying the nested specification. Each spawns a child
    /// observer that lives while the parent tuple does.
    pub nested: BTreeMap<String, Arc<WatchHandlers>>,
}

impl AddedResponse {
    /// No teardown, no children.
    #[must_use]
    pub fn none() -> Self {
        Self {
            on_removed: None,
            nested: BTreeMap::new(),
        }
    }

    /// Teardown only.
    #[must_use]
    pub fn with_removal(handle: RemovalHandle) -> Self {
        Self {
            on_removed: Some(handle),
            nested: BTreeMap::new(),
        }
    }
}

/// Callbacks for one watched specification.
///
/// Callbacks run on the dispatch worker; they must not call back into
/// their own observer.
pub struct WatchHandlers {
    /// Invoked exactly once per tuple.
    pub added: Box<dyn Fn(&SpecificationResult) -> AddedResponse + Send + Sync>,
}

impl WatchHandlers {
    /// Handlers from an `added` closure.
    #[must_use]
    pub fn on_added(
        added: impl Fn(&SpecificationResult) -> AddedResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            added: Box::new(added),
        }
    }
}

struct TupleState {
    on_removed: Option<RemovalHandle>,
    children: Vec<Arc<Observer>>,
}

#[derive(Default)]
struct ObserverState {
    tuples: HashMap<String, TupleState>,
}

/// A live specification subscription.
pub struct Observer {
    id: Uuid,
    specification: Specification,
    given: Vec<FactReference>,
    storage: Arc<dyn Storage>,
    source: Arc<ObservableSource>,
    handlers: Arc<WatchHandlers>,
    relevant_types: HashSet<String>,
    stopped: AtomicBool,
    state: Mutex<ObserverState>,
}

impl Observer {
    /// Creates an observer. The specification is validated here, so a
    /// malformed one fails at subscription time, never silently.
    pub fn new(
        storage: Arc<dyn Storage>,
        source: Arc<ObservableSource>,
        specification: Specification,
        given: Vec<FactReference>,
        handlers: Arc<WatchHandlers>,
    ) -> FactlineResult<Arc<Self>> {
        specification.validate()?;
        let relevant_types = specification.referenced_types();
        Ok(Arc::new(Self {
            id: Uuid::new_v4(),
            specification,
            given,
            storage,
            source,
            handlers,
            relevant_types,
            stopped: AtomicBool::new(false),
            state: Mutex::new(ObserverState::default()),
        }))
    }

    /// Registers for notifications, then runs the initial pass. Returns
    /// once every initial tuple has been delivered, so callers can treat
    /// a successful return as "initialized".
    ///
    /// Registration happens first: a save landing between the two steps is
    /// either visible to the initial read or redelivered as a refresh, and
    /// the tuple set suppresses the duplicate either way.
    pub fn start(self: &Arc<Self>) -> FactlineResult<()> {
        let listener: Arc<dyn SourceListener> = Arc::clone(self) as Arc<dyn SourceListener>;
        self.source.register(listener)?;
        self.run_pass()
    }

    pub(crate) fn start_from_worker(self: &Arc<Self>) -> FactlineResult<()> {
        let listener: Arc<dyn SourceListener> = Arc::clone(self) as Arc<dyn SourceListener>;
        self.source.register_nowait(listener);
        self.run_pass()
    }

    /// Stops the subscription. Prompt: once this returns, no further
    /// callbacks are invoked; an in-flight pass completes and its results
    /// are discarded. Removal handles are dropped without being invoked —
    /// stopping is not removal.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source.unregister(self.id);
        if let Ok(mut state) = self.state.lock() {
            for (_, tuple) in state.tuples.drain() {
                for child in &tuple.children {
                    child.stop();
                }
            }
        }
    }

    /// Snapshot of the current result projections.
    pub fn results(&self) -> FactlineResult<Vec<Projected>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(FactlineError::Execution(ExecutionError::Cancelled {
                path: "observer".to_string(),
            }));
        }
        self.storage
            .read(&self.given, &self.specification)
            .map_err(FactlineError::from)
    }

    fn run_pass(&self) -> FactlineResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        let results = self
            .storage
            .read_results(&self.given, &self.specification)
            .map_err(FactlineError::from)?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| FactlineError::internal("observer state lock poisoned"))?;
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }

        let current: HashSet<String> = results.iter().map(SpecificationResult::tuple_key).collect();

        // Tuples that fell out did so through an existential flip.
        let stale: Vec<String> = state
            .tuples
            .keys()
            .filter(|key| !current.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(tuple) = state.tuples.remove(&key) {
                for child in &tuple.children {
                    child.stop();
                }
                if let Some(on_removed) = tuple.on_removed {
                    on_removed();
                }
            }
        }

        for result in results {
            let key = result.tuple_key();
            if state.tuples.contains_key(&key) {
                continue;
            }
            let response = (self.handlers.added)(&result);
            let children = self.spawn_children(&result, response.nested);
            state.tuples.insert(
                key,
                TupleState {
                    on_removed: response.on_removed,
                    children,
                },
            );
        }
        Ok(())
    }

    fn spawn_children(
        &self,
        result: &SpecificationResult,
        nested: BTreeMap<String, Arc<WatchHandlers>>,
    ) -> Vec<Arc<Observer>> {
        let mut children = Vec::new();
        for (component, handlers) in nested {
            let Some(specification) = nested_specification(&self.specification.projection, &component)
            else {
                tracing::warn!(%component, "no nested specification under this component");
                continue;
            };

            let mut child_given = Vec::with_capacity(specification.given.len());
            let mut complete = true;
            for label in &specification.given {
                match result
                    .bindings
                    .iter()
                    .find(|(name, _)| *name == label.name)
                {
                    Some((_, reference)) => child_given.push(reference.clone()),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                tracing::warn!(%component, "parent tuple does not bind the nested given");
                continue;
            }

            match Observer::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.source),
                specification.clone(),
                child_given,
                handlers,
            ) {
                Ok(child) => {
                    if let Err(err) = child.start_from_worker() {
                        tracing::warn!(%err, %component, "nested observer failed to start");
                    } else {
                        children.push(child);
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, %component, "nested observer rejected");
                }
            }
        }
        children
    }
}

fn nested_specification<'a>(
    projection: &'a Projection,
    component: &str,
) -> Option<&'a Specification> {
    match projection {
        Projection::Record { components } => match components.get(component)? {
            Projection::Nested { specification } => Some(specification),
            _ => None,
        },
        Projection::Nested { specification } if component.is_empty() => Some(specification),
        _ => None,
    }
}

impl SourceListener for Observer {
    fn listener_id(&self) -> Uuid {
        self.id
    }

    fn is_relevant(&self, fact_types: &HashSet<String>) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && fact_types
                .iter()
                .any(|fact_type| self.relevant_types.contains(fact_type))
    }

    fn refresh(&self) {
        if let Err(err) = self.run_pass() {
            tracing::warn!(%err, "observer refresh failed");
        }
    }
}
