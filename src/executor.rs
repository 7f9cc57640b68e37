//! Graph walk evaluation.
//!
//! Both query surfaces execute against the same four primitives, exposed by
//! the [`GraphSource`] trait: fact lookup, predecessor and successor joins,
//! and insertion order. Storage backends implement the trait over their
//! indexes; evidence bundles implement it over the submitted closure, so
//! authorization rules run the same executor against a much smaller graph.

use std::collections::HashSet;

use crate::error::{FactlineResult, ValidationError};
use crate::fact::{Fact, FactReference};
use crate::query::{
    Direction, Match, MatchCondition, PathCondition, Projected, Projection, Quantifier,
    Specification, Step, StepQuery,
};
use crate::value::FieldValue;

/// Minimal graph access the executor needs.
pub trait GraphSource {
    /// Look up a fact by reference.
    fn fact(&self, reference: &FactReference) -> Option<Fact>;

    /// Predecessors of a fact under a role, in declaration order.
    fn predecessors(&self, reference: &FactReference, role: &str) -> Vec<FactReference>;

    /// Successors naming a fact under a role, in insertion order, any type.
    fn successors(&self, reference: &FactReference, role: &str) -> Vec<FactReference>;

    /// Position of the fact in storage insertion order.
    fn insertion_index(&self, reference: &FactReference) -> Option<u64>;

    /// Whether the fact is present.
    fn contains(&self, reference: &FactReference) -> bool {
        self.insertion_index(reference).is_some()
    }
}

/// An ordered set of label bindings. Binding order is given order followed
/// by match order.
pub type Environment = Vec<(String, FactReference)>;

fn lookup<'a>(env: &'a Environment, label: &str) -> Option<&'a FactReference> {
    env.iter().find(|(name, _)| name == label).map(|(_, r)| r)
}

fn push_unique(set: &mut Vec<FactReference>, seen: &mut HashSet<String>, reference: FactReference) {
    if seen.insert(reference.key()) {
        set.push(reference);
    }
}

// ---------------------------------------------------------------------------
// Step form
// ---------------------------------------------------------------------------

/// Executes a legacy step query from a starting fact.
///
/// A walk that demands a fact the source does not hold simply produces no
/// results; authorization relies on this to fail closed over evidence.
pub fn execute_steps(
    source: &dyn GraphSource,
    start: &FactReference,
    query: &StepQuery,
) -> Vec<FactReference> {
    let mut current = vec![start.clone()];
    for step in &query.steps {
        current = apply_step(source, current, step);
        if current.is_empty() {
            break;
        }
    }
    current
}

fn apply_step(
    source: &dyn GraphSource,
    current: Vec<FactReference>,
    step: &Step,
) -> Vec<FactReference> {
    match step {
        Step::Property { name, value } => current
            .into_iter()
            .filter(|reference| property_matches(source, reference, name, value))
            .collect(),
        Step::Join { direction, role } => {
            let mut next = Vec::new();
            let mut seen = HashSet::new();
            for reference in &current {
                let joined = match direction {
                    Direction::Predecessor => source.predecessors(reference, role),
                    Direction::Successor => source.successors(reference, role),
                };
                for target in joined {
                    push_unique(&mut next, &mut seen, target);
                }
            }
            if matches!(direction, Direction::Successor) {
                next.sort_by_key(|r| source.insertion_index(r).unwrap_or(u64::MAX));
            }
            next
        }
        Step::Existential { quantifier, steps } => {
            let sub_query = StepQuery::new(steps.clone());
            current
                .into_iter()
                .filter(|reference| {
                    let non_empty = !execute_steps(source, reference, &sub_query).is_empty();
                    match quantifier {
                        Quantifier::Exists => non_empty,
                        Quantifier::NotExists => !non_empty,
                    }
                })
                .collect()
        }
    }
}

fn property_matches(
    source: &dyn GraphSource,
    reference: &FactReference,
    name: &str,
    value: &FieldValue,
) -> bool {
    if name == "type" {
        return match value {
            FieldValue::String(expected) => reference.fact_type == *expected,
            _ => false,
        };
    }
    source
        .fact(reference)
        .and_then(|fact| fact.fields.get(name).cloned())
        .is_some_and(|actual| actual == *value)
}

// ---------------------------------------------------------------------------
// Specification form
// ---------------------------------------------------------------------------

/// Evaluates a specification, returning one environment per result tuple.
///
/// Tuples are ordered by storage insertion order of the first unknown's
/// binding, with later bindings breaking ties.
pub fn evaluate(
    source: &dyn GraphSource,
    specification: &Specification,
    given: &[FactReference],
) -> FactlineResult<Vec<Environment>> {
    if given.len() != specification.given.len() {
        return Err(ValidationError::MalformedSpecification {
            reason: format!(
                "expected {} given facts, got {}",
                specification.given.len(),
                given.len()
            ),
        }
        .into());
    }
    let mut initial: Environment = Vec::with_capacity(given.len());
    for (label, reference) in specification.given.iter().zip(given) {
        if label.fact_type != reference.fact_type {
            return Err(ValidationError::MalformedSpecification {
                reason: format!(
                    "given '{}' expects type '{}', got '{}'",
                    label.name, label.fact_type, reference.fact_type
                ),
            }
            .into());
        }
        initial.push((label.name.clone(), reference.clone()));
    }

    let mut environments = evaluate_matches(source, &specification.matches, vec![initial]);
    environments.sort_by_key(|env| {
        env.iter()
            .skip(given.len())
            .map(|(_, r)| source.insertion_index(r).unwrap_or(u64::MAX))
            .collect::<Vec<_>>()
    });
    Ok(environments)
}

fn evaluate_matches(
    source: &dyn GraphSource,
    matches: &[Match],
    environments: Vec<Environment>,
) -> Vec<Environment> {
    let mut current = environments;
    for m in matches {
        let mut next = Vec::new();
        for env in &current {
            for candidate in bind_unknown(source, m, env) {
                let mut extended = env.clone();
                extended.push((m.unknown.name.clone(), candidate));
                next.push(extended);
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    current
}

fn bind_unknown(source: &dyn GraphSource, m: &Match, env: &Environment) -> Vec<FactReference> {
    let MatchCondition::Path(anchor) = &m.conditions[0] else {
        // Rejected by validation; nothing to bind without an anchor.
        return Vec::new();
    };
    let mut candidates = evaluate_path(source, anchor, &m.unknown.fact_type, env);

    for condition in &m.conditions[1..] {
        if candidates.is_empty() {
            break;
        }
        match condition {
            MatchCondition::Path(path) => {
                let allowed: HashSet<String> =
                    evaluate_path(source, path, &m.unknown.fact_type, env)
                        .into_iter()
                        .map(|r| r.key())
                        .collect();
                candidates.retain(|c| allowed.contains(&c.key()));
            }
            MatchCondition::Existential(existential) => {
                candidates.retain(|candidate| {
                    let mut extended = env.clone();
                    extended.push((m.unknown.name.clone(), candidate.clone()));
                    let sub =
                        evaluate_matches(source, &existential.matches, vec![extended]);
                    sub.is_empty() != existential.exists
                });
            }
        }
    }
    candidates
}

/// Walks a path condition: descend the anchor side through predecessor
/// roles, then ascend the unknown side through successor roles.
fn evaluate_path(
    source: &dyn GraphSource,
    path: &PathCondition,
    unknown_type: &str,
    env: &Environment,
) -> Vec<FactReference> {
    let Some(start) = lookup(env, &path.label_right) else {
        return Vec::new();
    };

    let mut set = vec![start.clone()];
    for role in &path.roles_right {
        let mut next = Vec::new();
        let mut seen = HashSet::new();
        for reference in &set {
            for predecessor in source.predecessors(reference, &role.name) {
                if predecessor.fact_type == role.predecessor_type {
                    push_unique(&mut next, &mut seen, predecessor);
                }
            }
        }
        set = next;
        if set.is_empty() {
            return set;
        }
    }

    for (index, role) in path.roles_left.iter().enumerate().rev() {
        let target_type = if index == 0 {
            unknown_type
        } else {
            path.roles_left[index - 1].predecessor_type.as_str()
        };
        let mut next = Vec::new();
        let mut seen = HashSet::new();
        for reference in &set {
            for successor in source.successors(reference, &role.name) {
                if successor.fact_type == target_type {
                    push_unique(&mut next, &mut seen, successor);
                }
            }
        }
        next.sort_by_key(|r| source.insertion_index(r).unwrap_or(u64::MAX));
        set = next;
        if set.is_empty() {
            return set;
        }
    }

    set
}

/// Projects one environment through a projection.
pub fn project(
    source: &dyn GraphSource,
    projection: &Projection,
    env: &Environment,
) -> FactlineResult<Projected> {
    match projection {
        Projection::Label { label } => {
            let reference = lookup(env, label).ok_or_else(|| ValidationError::UnboundLabel {
                label: label.clone(),
            })?;
            Ok(Projected::Reference(reference.clone()))
        }
        Projection::Tuple { labels } => {
            let mut references = Vec::with_capacity(labels.len());
            for label in labels {
                let reference =
                    lookup(env, label).ok_or_else(|| ValidationError::UnboundLabel {
                        label: label.clone(),
                    })?;
                references.push(reference.clone());
            }
            Ok(Projected::Tuple(references))
        }
        Projection::Record { components } => {
            let mut record = std::collections::BTreeMap::new();
            for (name, component) in components {
                record.insert(name.clone(), project(source, component, env)?);
            }
            Ok(Projected::Record(record))
        }
        Projection::Nested { specification } => {
            let mut given = Vec::with_capacity(specification.given.len());
            for label in &specification.given {
                let reference =
                    lookup(env, &label.name).ok_or_else(|| ValidationError::UnboundLabel {
                        label: label.name.clone(),
                    })?;
                given.push(reference.clone());
            }
            let sub_envs = evaluate(source, specification, &given)?;
            let mut collection = Vec::with_capacity(sub_envs.len());
            for sub_env in &sub_envs {
                collection.push(project(source, &specification.projection, sub_env)?);
            }
            Ok(Projected::Collection(collection))
        }
    }
}

/// Evaluates and projects in one pass, keeping environments alongside
/// projections so observers can key tuples by their bindings.
pub fn evaluate_projected(
    source: &dyn GraphSource,
    specification: &Specification,
    given: &[FactReference],
) -> FactlineResult<Vec<(Environment, Projected)>> {
    let environments = evaluate(source, specification, given)?;
    let mut results = Vec::with_capacity(environments.len());
    for env in environments {
        let projected = project(source, &specification.projection, &env)?;
        results.push((env, projected));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use crate::query::{ExistentialCondition, Label, Role};
    use std::collections::HashMap;

    /// A tiny graph for executor tests: facts in insertion order.
    #[derive(Default)]
    struct TestGraph {
        order: Vec<FactReference>,
        facts: HashMap<String, Fact>,
    }

    impl TestGraph {
        fn add(&mut self, fact: &Fact) -> FactReference {
            let reference = fact.reference().unwrap();
            if !self.facts.contains_key(&reference.key()) {
                self.order.push(reference.clone());
                self.facts.insert(reference.key(), fact.clone());
            }
            reference
        }
    }

    impl GraphSource for TestGraph {
        fn fact(&self, reference: &FactReference) -> Option<Fact> {
            self.facts.get(&reference.key()).cloned()
        }

        fn predecessors(&self, reference: &FactReference, role: &str) -> Vec<FactReference> {
            self.fact(reference)
                .and_then(|f| f.predecessors.get(role).cloned())
                .unwrap_or_default()
        }

        fn successors(&self, reference: &FactReference, role: &str) -> Vec<FactReference> {
            self.order
                .iter()
                .filter(|candidate| {
                    self.facts
                        .get(&candidate.key())
                        .and_then(|f| f.predecessors.get(role))
                        .is_some_and(|list| list.contains(reference))
                })
                .cloned()
                .collect()
        }

        fn insertion_index(&self, reference: &FactReference) -> Option<u64> {
            self.order
                .iter()
                .position(|r| r == reference)
                .map(|i| i as u64)
        }
    }

    fn chores_graph() -> (TestGraph, FactReference, FactReference, FactReference) {
        let mut graph = TestGraph::default();
        let list = Fact::new("List").with_field("name", "Chores");
        let list_ref = graph.add(&list);
        let task = Fact::new("Task")
            .with_field("description", "trash")
            .with_predecessor("list", list_ref.clone());
        let task_ref = graph.add(&task);
        let task2 = Fact::new("Task")
            .with_field("description", "dishes")
            .with_predecessor("list", list_ref.clone());
        let task2_ref = graph.add(&task2);
        (graph, list_ref, task_ref, task2_ref)
    }

    #[test]
    fn predecessor_walk_with_type_filter() {
        let (graph, list_ref, task_ref, _) = chores_graph();
        let query = StepQuery::default().predecessor("list").of_type("List");
        let result = execute_steps(&graph, &task_ref, &query);
        assert_eq!(result, vec![list_ref]);
    }

    #[test]
    fn successor_walk_with_type_filter() {
        let (graph, list_ref, task_ref, task2_ref) = chores_graph();
        let query = StepQuery::default().successor("list").of_type("Task");
        let result = execute_steps(&graph, &list_ref, &query);
        assert_eq!(result, vec![task_ref, task2_ref]);
    }

    #[test]
    fn existential_not_exists_filters() {
        let (mut graph, list_ref, _, task2_ref) = chores_graph();
        let done = Fact::new("TaskComplete")
            .with_field("completed", true)
            .with_predecessor("task", task2_ref.clone());
        graph.add(&done);

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
        let result = execute_steps(&graph, &list_ref, &query);
        assert_eq!(result.len(), 1);
        assert_ne!(result[0], task2_ref);
    }

    fn open_tasks_spec() -> Specification {
        Specification::new(
            vec![Label::new("list", "List")],
            vec![Match::new(
                Label::new("task", "Task"),
                vec![
                    MatchCondition::Path(PathCondition {
                        roles_left: vec![Role::new("list", "List")],
                        label_right: "list".to_string(),
                        roles_right: vec![],
                    }),
                    MatchCondition::Existential(ExistentialCondition {
                        exists: false,
                        matches: vec![Match::new(
                            Label::new("completion", "TaskComplete"),
                            vec![MatchCondition::Path(PathCondition {
                                roles_left: vec![Role::new("task", "Task")],
                                label_right: "task".to_string(),
                                roles_right: vec![],
                            })],
                        )],
                    }),
                ],
            )],
            Projection::Label {
                label: "task".to_string(),
            },
        )
    }

    #[test]
    fn specification_binds_in_insertion_order() {
        let (graph, list_ref, task_ref, task2_ref) = chores_graph();
        let spec = Specification::new(
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
        );
        spec.validate().unwrap();

        let envs = evaluate(&graph, &spec, std::slice::from_ref(&list_ref)).unwrap();
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0][1].1, task_ref);
        assert_eq!(envs[1][1].1, task2_ref);
    }

    #[test]
    fn existential_condition_flips_with_evidence() {
        let (mut graph, list_ref, task_ref, task2_ref) = chores_graph();
        let spec = open_tasks_spec();
        spec.validate().unwrap();

        let envs = evaluate(&graph, &spec, std::slice::from_ref(&list_ref)).unwrap();
        assert_eq!(envs.len(), 2);

        let done = Fact::new("TaskComplete")
            .with_field("completed", true)
            .with_predecessor("task", task2_ref);
        graph.add(&done);

        let envs = evaluate(&graph, &spec, std::slice::from_ref(&list_ref)).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0][1].1, task_ref);
    }

    #[test]
    fn exists_and_not_exists_partition_the_universe() {
        let (mut graph, list_ref, _, task2_ref) = chores_graph();
        let done = Fact::new("TaskComplete")
            .with_field("completed", true)
            .with_predecessor("task", task2_ref);
        graph.add(&done);

        let open = open_tasks_spec();
        let mut closed = open.clone();
        let MatchCondition::Existential(existential) = &mut closed.matches[0].conditions[1]
        else {
            unreachable!()
        };
        existential.exists = true;

        let open_envs = evaluate(&graph, &open, std::slice::from_ref(&list_ref)).unwrap();
        let closed_envs = evaluate(&graph, &closed, std::slice::from_ref(&list_ref)).unwrap();
        assert_eq!(open_envs.len() + closed_envs.len(), 2);
        assert_ne!(open_envs[0][1].1, closed_envs[0][1].1);
    }

    #[test]
    fn step_and_specification_forms_agree() {
        let (graph, list_ref, _, _) = chores_graph();

        let steps = StepQuery::default().successor("list").of_type("Task");
        let by_steps = execute_steps(&graph, &list_ref, &steps);

        let spec = Specification::new(
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
        );
        let by_spec: Vec<FactReference> =
            evaluate(&graph, &spec, std::slice::from_ref(&list_ref))
                .unwrap()
                .into_iter()
                .map(|env| env[1].1.clone())
                .collect();

        assert_eq!(by_steps, by_spec);
    }

    #[test]
    fn path_through_common_ancestor() {
        // owner <- list <- task; find the owner of a task's list.
        let mut graph = TestGraph::default();
        let owner = Fact::new("User").with_field("key", "alice");
        let owner_ref = graph.add(&owner);
        let list = Fact::new("List")
            .with_field("name", "Chores")
            .with_predecessor("owner", owner_ref.clone());
        let list_ref = graph.add(&list);
        let task = Fact::new("Task")
            .with_field("description", "trash")
            .with_predecessor("list", list_ref);
        let task_ref = graph.add(&task);

        let spec = Specification::new(
            vec![Label::new("task", "Task")],
            vec![Match::new(
                Label::new("owner", "User"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![],
                    label_right: "task".to_string(),
                    roles_right: vec![
                        Role::new("list", "List"),
                        Role::new("owner", "User"),
                    ],
                })],
            )],
            Projection::Label {
                label: "owner".to_string(),
            },
        );
        spec.validate().unwrap();

        let envs = evaluate(&graph, &spec, std::slice::from_ref(&task_ref)).unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0][1].1, owner_ref);
    }

    #[test]
    fn nested_projection_yields_sub_collections() {
        let (graph, list_ref, task_ref, task2_ref) = chores_graph();

        let inner = Specification::new(
            vec![Label::new("task", "Task")],
            vec![Match::new(
                Label::new("completion", "TaskComplete"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![Role::new("task", "Task")],
                    label_right: "task".to_string(),
                    roles_right: vec![],
                })],
            )],
            Projection::Label {
                label: "completion".to_string(),
            },
        );
        let spec = Specification::new(
            vec![Label::new("list", "List")],
            vec![Match::new(
                Label::new("task", "Task"),
                vec![MatchCondition::Path(PathCondition {
                    roles_left: vec![Role::new("list", "List")],
                    label_right: "list".to_string(),
                    roles_right: vec![],
                })],
            )],
            Projection::Record {
                components: [
                    (
                        "task".to_string(),
                        Projection::Label {
                            label: "task".to_string(),
                        },
                    ),
                    (
                        "completions".to_string(),
                        Projection::Nested {
                            specification: Box::new(inner),
                        },
                    ),
                ]
                .into_iter()
                .collect(),
            },
        );
        spec.validate().unwrap();

        let results = evaluate_projected(&graph, &spec, std::slice::from_ref(&list_ref)).unwrap();
        assert_eq!(results.len(), 2);
        let Projected::Record(record) = &results[0].1 else {
            panic!("expected record");
        };
        assert_eq!(
            record.get("task"),
            Some(&Projected::Reference(task_ref))
        );
        assert_eq!(record.get("completions"), Some(&Projected::Collection(vec![])));
        let Projected::Record(record) = &results[1].1 else {
            panic!("expected record");
        };
        assert_eq!(record.get("task"), Some(&Projected::Reference(task2_ref)));
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let (graph, list_ref, _, _) = chores_graph();
        let spec = open_tasks_spec();
        let err = evaluate(&graph, &spec, &[list_ref.clone(), list_ref]).unwrap_err();
        assert!(err.is_validation());
    }
}
