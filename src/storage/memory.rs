//! In-memory storage backend.
//!
//! Thread-safe reference implementation of the storage contract, intended
//! for embedded usage and tests. Keeps the fact map, the edge indexes, the
//! ancestor closure map, bookmarks, and logins behind a single `RwLock`,
//! which also makes the save-plus-bookmark step atomic.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::executor::{self, GraphSource};
use crate::fact::{Fact, FactEnvelope, FactReference};
use crate::query::{Specification, StepQuery};
use crate::storage::traits::{
    Edge, FeedDescriptor, FeedResponse, LoginRecord, SpecificationResult, Storage, StorageError,
};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug)]
struct StoredFact {
    envelope: FactEnvelope,
    index: u64,
}

#[derive(Debug, Default)]
struct State {
    facts: HashMap<String, StoredFact>,
    order: Vec<FactReference>,
    edges: Vec<Edge>,
    // Secondary indexes hold positions into `edges`.
    by_predecessor_role: HashMap<(String, String), Vec<usize>>,
    by_successor_role: HashMap<(String, String), Vec<usize>>,
    by_successor: HashMap<String, Vec<usize>>,
    ancestors: HashMap<String, Vec<FactReference>>,
    bookmarks: HashMap<String, String>,
    logins: HashMap<String, LoginRecord>,
}

impl State {
    fn contains(&self, reference: &FactReference) -> bool {
        self.facts.contains_key(&reference.key())
    }

    /// Saves one envelope; returns true if it was newly written.
    fn insert(&mut self, envelope: &FactEnvelope) -> Result<bool, StorageError> {
        envelope
            .fact
            .validate()
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        let reference = envelope
            .reference()
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        let key = reference.key();
        if self.facts.contains_key(&key) {
            return Ok(false);
        }

        // DAG closure under save: all predecessors must already be present.
        for predecessor in envelope.fact.predecessor_references() {
            if !self.contains(predecessor) {
                return Err(StorageError::NotFound(predecessor.key()));
            }
        }

        // Ancestor closure: self plus the union of predecessor closures.
        let mut closure = vec![reference.clone()];
        let mut seen: HashSet<String> = [key.clone()].into_iter().collect();
        for predecessor in envelope.fact.predecessor_references() {
            let ancestors = self
                .ancestors
                .get(&predecessor.key())
                .ok_or_else(|| StorageError::Corrupt(predecessor.key()))?;
            for ancestor in ancestors {
                if seen.insert(ancestor.key()) {
                    closure.push(ancestor.clone());
                }
            }
        }
        self.ancestors.insert(key.clone(), closure);

        for (role, predecessors) in &envelope.fact.predecessors {
            for predecessor in predecessors {
                let position = self.edges.len();
                self.edges.push(Edge {
                    successor: reference.clone(),
                    predecessor: predecessor.clone(),
                    role: role.clone(),
                });
                self.by_predecessor_role
                    .entry((predecessor.key(), role.clone()))
                    .or_default()
                    .push(position);
                self.by_successor_role
                    .entry((key.clone(), role.clone()))
                    .or_default()
                    .push(position);
                self.by_successor.entry(key.clone()).or_default().push(position);
            }
        }

        let index = self.order.len() as u64;
        self.order.push(reference.clone());
        self.facts.insert(
            key,
            StoredFact {
                envelope: envelope.clone(),
                index,
            },
        );
        Ok(true)
    }

    fn save_batch(
        &mut self,
        envelopes: &[FactEnvelope],
    ) -> Result<Vec<FactEnvelope>, StorageError> {
        let mut novel = Vec::new();
        for envelope in envelopes {
            if self.insert(envelope)? {
                novel.push(envelope.clone());
            }
        }
        Ok(novel)
    }
}

impl GraphSource for State {
    fn fact(&self, reference: &FactReference) -> Option<Fact> {
        self.facts
            .get(&reference.key())
            .map(|stored| stored.envelope.fact.clone())
    }

    fn predecessors(&self, reference: &FactReference, role: &str) -> Vec<FactReference> {
        self.facts
            .get(&reference.key())
            .and_then(|stored| stored.envelope.fact.predecessors.get(role).cloned())
            .unwrap_or_default()
    }

    fn successors(&self, reference: &FactReference, role: &str) -> Vec<FactReference> {
        self.by_predecessor_role
            .get(&(reference.key(), role.to_string()))
            .map(|positions| {
                positions
                    .iter()
                    .map(|&p| self.edges[p].successor.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insertion_index(&self, reference: &FactReference) -> Option<u64> {
        self.facts.get(&reference.key()).map(|stored| stored.index)
    }
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored facts.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("len"))?.order.len())
    }

    /// True if nothing has been stored.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Number of derived edges. Exposed for invariant checks in tests.
    pub fn edge_count(&self) -> Result<usize, StorageError> {
        Ok(self
            .state
            .read()
            .map_err(|_| lock_err("edge_count"))?
            .edges
            .len())
    }
}

impl Storage for MemoryStore {
    fn save(&self, envelopes: &[FactEnvelope]) -> Result<Vec<FactEnvelope>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("save"))?;
        state.save_batch(envelopes)
    }

    fn save_with_bookmark(
        &self,
        envelopes: &[FactEnvelope],
        feed: &str,
        bookmark: &str,
    ) -> Result<Vec<FactEnvelope>, StorageError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| lock_err("save_with_bookmark"))?;
        let novel = state.save_batch(envelopes)?;
        state
            .bookmarks
            .insert(feed.to_string(), bookmark.to_string());
        Ok(novel)
    }

    fn load(&self, references: &[FactReference]) -> Result<Vec<FactEnvelope>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("load"))?;

        let mut keys: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for reference in references {
            let key = reference.key();
            let Some(_) = state.facts.get(&key) else {
                continue;
            };
            let closure = state
                .ancestors
                .get(&key)
                .ok_or_else(|| StorageError::Corrupt(key.clone()))?;
            for ancestor in closure {
                let ancestor_key = ancestor.key();
                if seen.insert(ancestor_key.clone()) {
                    keys.push(ancestor_key);
                }
            }
        }

        let mut stored: Vec<&StoredFact> = Vec::with_capacity(keys.len());
        for key in &keys {
            let fact = state
                .facts
                .get(key)
                .ok_or_else(|| StorageError::Corrupt(key.clone()))?;
            stored.push(fact);
        }
        // Predecessors first: insertion order is already topological.
        stored.sort_by_key(|fact| fact.index);
        Ok(stored.into_iter().map(|f| f.envelope.clone()).collect())
    }

    fn which_exist(
        &self,
        references: &[FactReference],
    ) -> Result<Vec<FactReference>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("which_exist"))?;
        Ok(references
            .iter()
            .filter(|reference| state.contains(reference))
            .cloned()
            .collect())
    }

    fn query(
        &self,
        start: &FactReference,
        query: &StepQuery,
    ) -> Result<Vec<FactReference>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("query"))?;
        Ok(executor::execute_steps(&*state, start, query))
    }

    fn read_results(
        &self,
        given: &[FactReference],
        specification: &Specification,
    ) -> Result<Vec<SpecificationResult>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("read"))?;
        let results = executor::evaluate_projected(&*state, specification, given)
            .map_err(|e| StorageError::Invalid(e.to_string()))?;
        Ok(results
            .into_iter()
            .map(|(bindings, projection)| SpecificationResult {
                bindings,
                projection,
            })
            .collect())
    }

    fn feed(
        &self,
        descriptor: &FeedDescriptor,
        bookmark: &str,
    ) -> Result<FeedResponse, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("feed"))?;
        let since: u64 = if bookmark.is_empty() {
            0
        } else {
            bookmark
                .parse()
                .map_err(|_| StorageError::Invalid(format!("bad bookmark '{bookmark}'")))?
        };

        let environments = executor::evaluate(&*state, &descriptor.specification, &descriptor.given)
            .map_err(|e| StorageError::Invalid(e.to_string()))?;

        let mut references = Vec::new();
        let mut seen = HashSet::new();
        for env in &environments {
            for (_, reference) in env.iter().skip(descriptor.given.len()) {
                let index = state.insertion_index(reference).unwrap_or(u64::MAX);
                if index >= since && seen.insert(reference.key()) {
                    references.push((index, reference.clone()));
                }
            }
        }
        references.sort_by_key(|(index, _)| *index);

        Ok(FeedResponse {
            references: references.into_iter().map(|(_, r)| r).collect(),
            bookmark: state.order.len().to_string(),
        })
    }

    fn load_bookmark(&self, feed: &str) -> Result<String, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("load_bookmark"))?;
        state
            .bookmarks
            .get(feed)
            .cloned()
            .ok_or_else(|| StorageError::BookmarkNotFound(feed.to_string()))
    }

    fn save_bookmark(&self, feed: &str, bookmark: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("save_bookmark"))?;
        state
            .bookmarks
            .insert(feed.to_string(), bookmark.to_string());
        Ok(())
    }

    fn load_login(&self, session_token: &str) -> Result<Option<LoginRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("load_login"))?;
        Ok(state.logins.get(session_token).cloned())
    }

    fn save_login(&self, session_token: &str, login: LoginRecord) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("save_login"))?;
        state.logins.insert(session_token.to_string(), login);
        Ok(())
    }
}
