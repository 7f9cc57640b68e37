use std::sync::Arc;

use factline::{
    AuthenticationProvider, AuthorizationRules, DefaultPolicy, Fact, FactManager, FactReference,
    Label, Match, MatchCondition, MemoryStore, PathCondition, Projection, Role, Specification,
    Storage,
};

struct FixedIdentity(FactReference);

impl AuthenticationProvider for FixedIdentity {
    fn user_identity(&self) -> Option<FactReference> {
        Some(self.0.clone())
    }
}

/// The owner of a task's list must be the submitting user.
fn task_owner_rule() -> AuthorizationRules {
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
    AuthorizationRules::new(DefaultPolicy::Permissive)
        .with_specification("Task", spec)
        .unwrap()
}

fn manager_as(user: &Fact) -> Arc<FactManager> {
    FactManager::builder(Arc::new(MemoryStore::new()))
        .authorization(task_owner_rule())
        .authentication(Arc::new(FixedIdentity(user.reference().unwrap())))
        .build()
}

#[test]
fn matching_owner_may_publish() {
    let alice = Fact::new("User").with_field("key", "alice");
    let manager = manager_as(&alice);

    let list = Fact::new("List")
        .with_field("name", "Chores")
        .with_predecessor("owner", alice.reference().unwrap());
    let task = Fact::new("Task")
        .with_field("description", "trash")
        .with_predecessor("list", list.reference().unwrap());

    let saved = manager
        .save_facts(vec![alice.clone(), list, task])
        .unwrap();
    assert_eq!(saved.len(), 3);
}

#[test]
fn mismatched_owner_is_forbidden_and_nothing_persists() {
    let alice = Fact::new("User").with_field("key", "alice");
    let bob = Fact::new("User").with_field("key", "bob");
    let manager = manager_as(&alice);

    let list = Fact::new("List")
        .with_field("name", "Theirs")
        .with_predecessor("owner", bob.reference().unwrap());
    let task = Fact::new("Task")
        .with_field("description", "trash")
        .with_predecessor("list", list.reference().unwrap());

    let err = manager
        .save_facts(vec![bob, list, task.clone()])
        .unwrap_err();
    assert!(err.is_forbidden());
    assert!(err.to_string().contains("Task"));

    // No partial effect: the rejected fact is absent.
    let present = manager
        .storage()
        .which_exist(&[task.reference().unwrap()])
        .unwrap();
    assert!(present.is_empty());
}

#[test]
fn successor_rules_are_rejected_at_configuration_time() {
    // "Lists that have at least one task" requires walking successors,
    // which evidence can never prove.
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
    let err = AuthorizationRules::new(DefaultPolicy::Strict)
        .with_specification("List", spec)
        .unwrap_err();
    assert!(err.is_validation());
}
