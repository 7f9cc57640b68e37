//! The specification form: labeled unknowns, path and existential
//! conditions, and composable projections.
//!
//! A specification binds each unknown through path conditions anchored on
//! already-bound labels. Walks meet at a common ancestor: the right side
//! descends from the anchor through predecessor roles, the left side
//! ascends to the unknown through successor roles. Existential conditions
//! recurse with the current environment in scope.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::fact::FactReference;

/// A named unknown or given, with its declared fact type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Binding name, unique within a specification.
    pub name: String,
    /// Declared fact type of whatever binds to this label.
    #[serde(rename = "type")]
    pub fact_type: String,
}

impl Label {
    /// Creates a label.
    #[must_use]
    pub fn new(name: impl Into<String>, fact_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fact_type: fact_type.into(),
        }
    }
}

/// One predecessor role hop, with the type it is declared to reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role name on the successor side of the hop.
    pub name: String,
    /// Declared type of the predecessor the role points at.
    pub predecessor_type: String,
}

impl Role {
    /// Creates a role hop.
    #[must_use]
    pub fn new(name: impl Into<String>, predecessor_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predecessor_type: predecessor_type.into(),
        }
    }
}

/// Joins an unknown to an already-bound label through a common ancestor.
///
/// `roles_right` is walked from `label_right` as predecessor steps;
/// `roles_left` is the unknown-side chain, listed from the unknown
/// downward. Execution descends the right side and then ascends the left
/// side in reverse. Either side may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCondition {
    /// Unknown-side chain, from the unknown toward the ancestor.
    pub roles_left: Vec<Role>,
    /// The anchor label; must already be bound.
    pub label_right: String,
    /// Anchor-side chain, from the anchor toward the ancestor.
    pub roles_right: Vec<Role>,
}

/// Filters tuples by whether a nested sub-specification has results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistentialCondition {
    /// Keep tuples whose sub-matches are non-empty (`true`) or empty
    /// (`false`).
    pub exists: bool,
    /// Sub-matches, evaluated with the enclosing environment in scope.
    pub matches: Vec<Match>,
}

/// A condition constraining an unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum MatchCondition {
    Path(PathCondition),
    Existential(ExistentialCondition),
}

/// Binds one unknown through one or more conditions.
///
/// The first condition must be a path condition; it anchors the unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// The label this match binds.
    pub unknown: Label,
    /// Conditions, anchor first.
    pub conditions: Vec<MatchCondition>,
}

impl Match {
    /// Creates a match.
    #[must_use]
    pub fn new(unknown: Label, conditions: Vec<MatchCondition>) -> Self {
        Self { unknown, conditions }
    }
}

/// What a specification returns per result tuple.
///
/// Projections compose without limit: a record component may itself be a
/// nested specification producing a sub-collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "projection", rename_all = "snake_case")]
pub enum Projection {
    /// A single label's reference.
    Label {
        /// The projected label.
        label: String,
    },
    /// A tuple of label references.
    Tuple {
        /// Labels in tuple order.
        labels: Vec<String>,
    },
    /// Named components, each a projection of its own.
    Record {
        /// Components by name.
        components: BTreeMap<String, Projection>,
    },
    /// A sub-specification whose given labels are bound from the parent
    /// tuple, yielding a sub-collection.
    Nested {
        /// The sub-specification.
        specification: Box<Specification>,
    },
}

/// One projected result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Projected {
    Reference(FactReference),
    Tuple(Vec<FactReference>),
    Record(BTreeMap<String, Projected>),
    Collection(Vec<Projected>),
}

/// A compilable query: given labels, matches binding unknowns, and a
/// projection over the result tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specification {
    /// Starting labels, bound by the caller.
    pub given: Vec<Label>,
    /// Matches, each binding one unknown.
    pub matches: Vec<Match>,
    /// What to return per tuple.
    pub projection: Projection,
}

impl Specification {
    /// Creates a specification.
    #[must_use]
    pub fn new(given: Vec<Label>, matches: Vec<Match>, projection: Projection) -> Self {
        Self {
            given,
            matches,
            projection,
        }
    }

    /// Compile-time validation.
    ///
    /// Rejects: empty given, duplicate labels, an unknown referenced
    /// before it is bound, a match anchored on its own unknown, a first
    /// condition that is not a path condition, and role chains whose
    /// declared types cannot meet.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.given.is_empty() {
            return Err(ValidationError::MalformedSpecification {
                reason: "specification has no given labels".to_string(),
            });
        }

        let mut bound: BTreeMap<String, String> = BTreeMap::new();
        for label in &self.given {
            if bound
                .insert(label.name.clone(), label.fact_type.clone())
                .is_some()
            {
                return Err(ValidationError::DuplicateLabel {
                    label: label.name.clone(),
                });
            }
        }

        validate_matches(&self.matches, &mut bound)?;
        validate_projection(&self.projection, &bound)
    }

    /// Every fact type this specification can touch: label types and role
    /// predecessor types, recursively. Drives notification relevance.
    #[must_use]
    pub fn referenced_types(&self) -> HashSet<String> {
        let mut types = HashSet::new();
        for label in &self.given {
            types.insert(label.fact_type.clone());
        }
        collect_match_types(&self.matches, &mut types);
        collect_projection_types(&self.projection, &mut types);
        types
    }
}

fn validate_matches(
    matches: &[Match],
    bound: &mut BTreeMap<String, String>,
) -> Result<(), ValidationError> {
    for m in matches {
        if bound.contains_key(&m.unknown.name) {
            return Err(ValidationError::DuplicateLabel {
                label: m.unknown.name.clone(),
            });
        }
        if m.conditions.is_empty() {
            return Err(ValidationError::MalformedSpecification {
                reason: format!("match for '{}' has no conditions", m.unknown.name),
            });
        }
        if !matches!(m.conditions[0], MatchCondition::Path(_)) {
            return Err(ValidationError::MalformedSpecification {
                reason: format!(
                    "match for '{}' must anchor with a path condition",
                    m.unknown.name
                ),
            });
        }

        for condition in &m.conditions {
            match condition {
                MatchCondition::Path(path) => {
                    if path.label_right == m.unknown.name {
                        return Err(ValidationError::MalformedSpecification {
                            reason: format!(
                                "match for '{}' anchors on its own unknown",
                                m.unknown.name
                            ),
                        });
                    }
                    let Some(right_type) = bound.get(&path.label_right) else {
                        return Err(ValidationError::UnboundLabel {
                            label: path.label_right.clone(),
                        });
                    };

                    let left_meet = path
                        .roles_left
                        .last()
                        .map_or(m.unknown.fact_type.as_str(), |r| {
                            r.predecessor_type.as_str()
                        });
                    let right_meet = path
                        .roles_right
                        .last()
                        .map_or(right_type.as_str(), |r| r.predecessor_type.as_str());
                    if left_meet != right_meet {
                        return Err(ValidationError::TypeContradiction {
                            label: m.unknown.name.clone(),
                            left: left_meet.to_string(),
                            right: right_meet.to_string(),
                        });
                    }
                }
                MatchCondition::Existential(existential) => {
                    // The unknown is in scope inside its own existentials.
                    let mut inner = bound.clone();
                    inner.insert(m.unknown.name.clone(), m.unknown.fact_type.clone());
                    validate_matches(&existential.matches, &mut inner)?;
                }
            }
        }

        bound.insert(m.unknown.name.clone(), m.unknown.fact_type.clone());
    }
    Ok(())
}

fn validate_projection(
    projection: &Projection,
    bound: &BTreeMap<String, String>,
) -> Result<(), ValidationError> {
    match projection {
        Projection::Label { label } => {
            if !bound.contains_key(label) {
                return Err(ValidationError::UnboundLabel {
                    label: label.clone(),
                });
            }
            Ok(())
        }
        Projection::Tuple { labels } => {
            for label in labels {
                if !bound.contains_key(label) {
                    return Err(ValidationError::UnboundLabel {
                        label: label.clone(),
                    });
                }
            }
            Ok(())
        }
        Projection::Record { components } => {
            for component in components.values() {
                validate_projection(component, bound)?;
            }
            Ok(())
        }
        Projection::Nested { specification } => {
            for given in &specification.given {
                match bound.get(&given.name) {
                    None => {
                        return Err(ValidationError::UnboundLabel {
                            label: given.name.clone(),
                        })
                    }
                    Some(fact_type) if *fact_type != given.fact_type => {
                        return Err(ValidationError::TypeContradiction {
                            label: given.name.clone(),
                            left: given.fact_type.clone(),
                            right: fact_type.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            specification.validate()
        }
    }
}

fn collect_match_types(matches: &[Match], types: &mut HashSet<String>) {
    for m in matches {
        types.insert(m.unknown.fact_type.clone());
        for condition in &m.conditions {
            match condition {
                MatchCondition::Path(path) => {
                    for role in path.roles_left.iter().chain(path.roles_right.iter()) {
                        types.insert(role.predecessor_type.clone());
                    }
                }
                MatchCondition::Existential(existential) => {
                    collect_match_types(&existential.matches, types);
                }
            }
        }
    }
}

fn collect_projection_types(projection: &Projection, types: &mut HashSet<String>) {
    match projection {
        Projection::Label { .. } | Projection::Tuple { .. } => {}
        Projection::Record { components } => {
            for component in components.values() {
                collect_projection_types(component, types);
            }
        }
        Projection::Nested { specification } => {
            for label in &specification.given {
                types.insert(label.fact_type.clone());
            }
            collect_match_types(&specification.matches, types);
            collect_projection_types(&specification.projection, types);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks_in_list() -> Specification {
        Specification::new(
            vec![Label::new("list", "List")],
            vec![Match::new(
                Label::new("task", "Task"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![Role::new("list", "List")],
                    label_right: "list".to_string(),
                    roles_right: vec![],
                })],
            )],
            Projection::Label {
                label: "task".to_string(),
            },
        )
    }

    #[test]
    fn valid_specification_passes() {
        tasks_in_list().validate().unwrap();
    }

    #[test]
    fn empty_given_is_rejected() {
        let spec = Specification::new(
            vec![],
            vec![],
            Projection::Label {
                label: "x".to_string(),
            },
        );
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::MalformedSpecification { .. })
        ));
    }

    #[test]
    fn unbound_anchor_is_rejected() {
        let mut spec = tasks_in_list();
        let MatchCondition::Path(path) = &mut spec.matches[0].conditions[0] else {
            unreachable!()
        };
        path.label_right = "nowhere".to_string();
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::UnboundLabel { .. })
        ));
    }

    #[test]
    fn self_anchor_is_rejected() {
        let mut spec = tasks_in_list();
        let MatchCondition::Path(path) = &mut spec.matches[0].conditions[0] else {
            unreachable!()
        };
        path.label_right = "task".to_string();
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::MalformedSpecification { .. })
        ));
    }

    #[test]
    fn first_condition_must_be_a_path() {
        let spec = Specification::new(
            vec![Label::new("list", "List")],
            vec![Match::new(
                Label::new("task", "Task"),
                vec![MatchCondition::Existential(ExistentialCondition {
                    exists: false,
                    matches: vec![],
                })],
            )],
            Projection::Label {
                label: "task".to_string(),
            },
        );
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::MalformedSpecification { .. })
        ));
    }

    #[test]
    fn mismatched_meet_types_are_rejected() {
        let spec = Specification::new(
            vec![Label::new("list", "List")],
            vec![Match::new(
                Label::new("task", "Task"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![Role::new("project", "Project")],
                    label_right: "list".to_string(),
                    roles_right: vec![],
                })],
            )],
            Projection::Label {
                label: "task".to_string(),
            },
        );
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::TypeContradiction { .. })
        ));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let spec = Specification::new(
            vec![Label::new("list", "List")],
            vec![Match::new(
                Label::new("list", "List"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![],
                    label_right: "list".to_string(),
                    roles_right: vec![],
                })],
            )],
            Projection::Label {
                label: "list".to_string(),
            },
        );
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::DuplicateLabel { .. })
        ));
    }

    #[test]
    fn referenced_types_cover_roles_and_labels() {
        let types = tasks_in_list().referenced_types();
        assert!(types.contains("List"));
        assert!(types.contains("Task"));
    }

    #[test]
    fn nested_projection_given_must_match_parent_types() {
        let inner = Specification::new(
            vec![Label::new("task", "Project")],
            vec![],
            Projection::Label {
                label: "task".to_string(),
            },
        );
        let spec = Specification::new(
            vec![Label::new("list", "List")],
            tasks_in_list().matches,
            Projection::Record {
                components: [(
                    "children".to_string(),
                    Projection::Nested {
                        specification: Box::new(inner),
                    },
                )]
                .into_iter()
                .collect(),
            },
        );
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::TypeContradiction { .. })
        ));
    }

    #[test]
    fn serde_round_trip() {
        let spec = tasks_in_list();
        let json = serde_json::to_string(&spec).unwrap();
        let back: Specification = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
