//! Legacy step queries.
//!
//! A step query is a linear walk: filter the current set, join to
//! predecessors or successors along a role, or gate on a nested
//! existential sub-walk. The specification form supersedes this surface,
//! but authorization query rules and a few callers still speak it.

use serde::{Deserialize, Serialize};

use crate::value::FieldValue;

/// Which way a join walks the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From a fact to the facts it names in a role.
    Predecessor,
    /// From a fact to the facts that name it in a role.
    Successor,
}

/// Whether an existential sub-walk must or must not produce results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantifier {
    Exists,
    NotExists,
}

/// One step of a legacy walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Keep facts whose named field equals the value. The name `type`
    /// compares the fact's type tag instead of a field.
    Property {
        /// Field name, or `type` for the type tag.
        name: String,
        /// Expected value.
        value: FieldValue,
    },

    /// Move the current set along a role.
    Join {
        /// Walk direction.
        direction: Direction,
        /// Role name.
        role: String,
    },

    /// Keep or drop facts by whether a sub-walk from them is non-empty.
    Existential {
        /// Keep on non-empty (`Exists`) or empty (`NotExists`).
        quantifier: Quantifier,
        /// The sub-walk.
        steps: Vec<Step>,
    },
}

/// A sequence of steps applied to a starting fact.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepQuery {
    /// The walk, applied in order.
    pub steps: Vec<Step>,
}

impl StepQuery {
    /// Creates a query from steps.
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Appends a predecessor join.
    #[must_use]
    pub fn predecessor(mut self, role: impl Into<String>) -> Self {
        self.steps.push(Step::Join {
            direction: Direction::Predecessor,
            role: role.into(),
        });
        self
    }

    /// Appends a successor join.
    #[must_use]
    pub fn successor(mut self, role: impl Into<String>) -> Self {
        self.steps.push(Step::Join {
            direction: Direction::Successor,
            role: role.into(),
        });
        self
    }

    /// Appends a type filter.
    #[must_use]
    pub fn of_type(mut self, fact_type: impl Into<String>) -> Self {
        self.steps.push(Step::Property {
            name: "type".to_string(),
            value: FieldValue::String(fact_type.into()),
        });
        self
    }

    /// Appends an existential gate.
    #[must_use]
    pub fn existential(mut self, quantifier: Quantifier, steps: Vec<Step>) -> Self {
        self.steps.push(Step::Existential { quantifier, steps });
        self
    }

    /// True if any step (at any depth) walks toward successors.
    ///
    /// Evidence bundles can prove what predecessors exist but never that
    /// successors are absent, so this drives the evidence/storage split.
    #[must_use]
    pub fn seeks_successors(&self) -> bool {
        steps_seek_successors(&self.steps)
    }
}

/// Whether any step in the slice, at any depth, walks toward successors.
pub fn steps_seek_successors(steps: &[Step]) -> bool {
    steps.iter().any(|step| match step {
        Step::Join {
            direction: Direction::Successor,
            ..
        } => true,
        Step::Existential { steps, .. } => steps_seek_successors(steps),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_expected_steps() {
        let query = StepQuery::default().predecessor("list").of_type("List");
        assert_eq!(query.steps.len(), 2);
        assert_eq!(
            query.steps[0],
            Step::Join {
                direction: Direction::Predecessor,
                role: "list".to_string()
            }
        );
        assert_eq!(
            query.steps[1],
            Step::Property {
                name: "type".to_string(),
                value: FieldValue::String("List".to_string()),
            }
        );
    }

    #[test]
    fn seeks_successors_looks_into_existentials() {
        let query = StepQuery::default().predecessor("list");
        assert!(!query.seeks_successors());

        let query = StepQuery::default().existential(
            Quantifier::NotExists,
            vec![Step::Join {
                direction: Direction::Successor,
                role: "task".to_string(),
            }],
        );
        assert!(query.seeks_successors());
    }

    #[test]
    fn serde_round_trip() {
        let query = StepQuery::default()
            .successor("list")
            .of_type("Task")
            .existential(
                Quantifier::NotExists,
                vec![Step::Join {
                    direction: Direction::Successor,
                    role: "task".to_string(),
                }],
            );
        let json = serde_json::to_string(&query).unwrap();
        let back: StepQuery = serde_json::from_str(&json).unwrap();
        assert_eq!(query, back);
    }
}
