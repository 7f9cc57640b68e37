//! Evidence bundles.
//!
//! When a caller submits a fact it also submits the transitive predecessor
//! closure. The bundle implements [`GraphSource`], so authorization rules
//! run the ordinary executor against it; a walk that demands a fact outside
//! the bundle finds nothing, which is exactly the fail-closed behavior the
//! rules rely on.

use std::collections::HashMap;

use crate::error::ValidationError;
use crate::executor::GraphSource;
use crate::fact::{Fact, FactEnvelope, FactReference};

/// The predecessor closure accompanying a save.
#[derive(Debug, Default)]
pub struct EvidenceBundle {
    order: Vec<FactReference>,
    facts: HashMap<String, Fact>,
}

impl EvidenceBundle {
    /// An empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a bundle from a batch of envelopes.
    pub fn from_envelopes(envelopes: &[FactEnvelope]) -> Result<Self, ValidationError> {
        let mut bundle = Self::new();
        for envelope in envelopes {
            bundle.add(&envelope.fact)?;
        }
        Ok(bundle)
    }

    /// Adds one fact; idempotent on content.
    pub fn add(&mut self, fact: &Fact) -> Result<(), ValidationError> {
        let reference = fact.reference()?;
        let key = reference.key();
        if !self.facts.contains_key(&key) {
            self.order.push(reference);
            self.facts.insert(key, fact.clone());
        }
        Ok(())
    }

    /// Whether the bundle holds this reference.
    #[must_use]
    pub fn contains(&self, reference: &FactReference) -> bool {
        self.facts.contains_key(&reference.key())
    }

    /// Number of facts in the bundle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if the bundle is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl GraphSource for EvidenceBundle {
    fn fact(&self, reference: &FactReference) -> Option<Fact> {
        self.facts.get(&reference.key()).cloned()
    }

    fn predecessors(&self, reference: &FactReference, role: &str) -> Vec<FactReference> {
        self.facts
            .get(&reference.key())
            .and_then(|fact| fact.predecessors.get(role).cloned())
            .unwrap_or_default()
    }

    fn successors(&self, reference: &FactReference, role: &str) -> Vec<FactReference> {
        // Bundles are small; a scan suffices. Authorization never walks
        // this direction, but the legacy query-rule prefix may be split
        // exactly at the first successor join, leaving this unused.
        self.order
            .iter()
            .filter(|candidate| {
                self.facts
                    .get(&candidate.key())
                    .and_then(|fact| fact.predecessors.get(role))
                    .is_some_and(|list| list.contains(reference))
            })
            .cloned()
            .collect()
    }

    fn insertion_index(&self, reference: &FactReference) -> Option<u64> {
        self.order
            .iter()
            .position(|candidate| candidate == reference)
            .map(|position| position as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor;
    use crate::query::StepQuery;

    #[test]
    fn bundle_dedupes_on_content() {
        let fact = Fact::new("List").with_field("name", "Chores");
        let mut bundle = EvidenceBundle::new();
        bundle.add(&fact).unwrap();
        bundle.add(&fact).unwrap();
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn walks_fail_closed_outside_the_bundle() {
        let list = Fact::new("List").with_field("name", "Chores");
        let task = Fact::new("Task")
            .with_field("description", "trash")
            .with_predecessor("list", list.reference().unwrap());

        // The bundle holds the task but not its list.
        let mut bundle = EvidenceBundle::new();
        bundle.add(&task).unwrap();

        let result = executor::execute_steps(
            &bundle,
            &task.reference().unwrap(),
            &StepQuery::default().predecessor("list").of_type("List"),
        );
        // The reference is reachable, but the missing fact stops any
        // further walk from it.
        assert_eq!(result.len(), 1);
        let onward = executor::execute_steps(
            &bundle,
            &result[0],
            &StepQuery::default().predecessor("owner").of_type("User"),
        );
        assert!(onward.is_empty());
    }

    #[test]
    fn complete_bundles_support_predecessor_walks() {
        let owner = Fact::new("User").with_field("key", "alice");
        let list = Fact::new("List")
            .with_field("name", "Chores")
            .with_predecessor("owner", owner.reference().unwrap());
        let task = Fact::new("Task")
            .with_field("description", "trash")
            .with_predecessor("list", list.reference().unwrap());

        let mut bundle = EvidenceBundle::new();
        bundle.add(&owner).unwrap();
        bundle.add(&list).unwrap();
        bundle.add(&task).unwrap();

        let result = executor::execute_steps(
            &bundle,
            &task.reference().unwrap(),
            &StepQuery::default()
                .predecessor("list")
                .predecessor("owner")
                .of_type("User"),
        );
        assert_eq!(result, vec![owner.reference().unwrap()]);
    }
}
