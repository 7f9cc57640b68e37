use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use factline::{
    AddedResponse, ExistentialCondition, Fact, FactManager, Label, Match, MatchCondition,
    MemoryStore, PathCondition, Projected, Projection, Role, Specification, WatchHandlers,
};

fn manager() -> Arc<FactManager> {
    FactManager::builder(Arc::new(MemoryStore::new())).build()
}

/// Tasks in a list with no TaskComplete successor.
fn open_tasks() -> Specification {
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

fn all_tasks() -> Specification {
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

fn wait_for(predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within timeout");
}

#[test]
fn watch_delivers_both_tasks_then_removes_the_completed_one() {
    let manager = manager();

    let list = Fact::new("List").with_field("name", "Chores");
    let task = Fact::new("Task")
        .with_field("description", "trash")
        .with_predecessor("list", list.reference().unwrap());
    let task2 = Fact::new("Task")
        .with_field("description", "dishes")
        .with_predecessor("list", list.reference().unwrap());
    manager
        .save_facts(vec![list.clone(), task.clone(), task2.clone()])
        .unwrap();

    let added: Arc<Mutex<Vec<Projected>>> = Arc::new(Mutex::new(Vec::new()));
    let removed: Arc<Mutex<Vec<Projected>>> = Arc::new(Mutex::new(Vec::new()));

    let added_in_cb = Arc::clone(&added);
    let removed_in_cb = Arc::clone(&removed);
    let observer = manager
        .watch(
            open_tasks(),
            vec![list.reference().unwrap()],
            Arc::new(WatchHandlers::on_added(move |result| {
                added_in_cb.lock().unwrap().push(result.projection.clone());
                let removed = Arc::clone(&removed_in_cb);
                let projection = result.projection.clone();
                AddedResponse::with_removal(Box::new(move || {
                    removed.lock().unwrap().push(projection);
                }))
            })),
        )
        .unwrap();

    // Initial pass delivered both tuples.
    assert_eq!(added.lock().unwrap().len(), 2);
    assert!(removed.lock().unwrap().is_empty());

    let completion = Fact::new("TaskComplete")
        .with_field("completed", true)
        .with_predecessor("task", task2.reference().unwrap());
    manager.save_facts(vec![completion]).unwrap();

    wait_for(|| removed.lock().unwrap().len() == 1);
    assert_eq!(
        removed.lock().unwrap()[0],
        Projected::Reference(task2.reference().unwrap())
    );
    // The open task was never removed.
    assert_eq!(added.lock().unwrap().len(), 2);

    observer.stop();
}

#[test]
fn added_is_exactly_once_over_an_observer_lifetime() {
    let manager = manager();

    let list = Fact::new("List").with_field("name", "Chores");
    manager.save_facts(vec![list.clone()]).unwrap();

    let added = Arc::new(AtomicUsize::new(0));
    let added_in_cb = Arc::clone(&added);
    let observer = manager
        .watch(
            all_tasks(),
            vec![list.reference().unwrap()],
            Arc::new(WatchHandlers::on_added(move |_| {
                added_in_cb.fetch_add(1, Ordering::SeqCst);
                AddedResponse::none()
            })),
        )
        .unwrap();

    let task = Fact::new("Task")
        .with_field("description", "trash")
        .with_predecessor("list", list.reference().unwrap());
    // Saving the same envelope twice produces one notification total.
    manager.save_facts(vec![task.clone()]).unwrap();
    manager.save_facts(vec![task]).unwrap();

    wait_for(|| added.load(Ordering::SeqCst) == 1);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(added.load(Ordering::SeqCst), 1);

    observer.stop();
}

#[test]
fn result_sets_grow_monotonically_without_not_exists() {
    let manager = manager();

    let list = Fact::new("List").with_field("name", "Chores");
    manager.save_facts(vec![list.clone()]).unwrap();

    let list_ref = list.reference().unwrap();
    let spec = all_tasks();

    let mut previous = 0;
    for description in ["one", "two", "three"] {
        let task = Fact::new("Task")
            .with_field("description", description)
            .with_predecessor("list", list_ref.clone());
        manager.save_facts(vec![task]).unwrap();

        let current = manager
            .read(std::slice::from_ref(&list_ref), &spec)
            .unwrap()
            .len();
        assert!(current > previous, "result set must strictly grow");
        previous = current;
    }
}

#[test]
fn exists_and_not_exists_partition_the_tasks() {
    let manager = manager();

    let list = Fact::new("List").with_field("name", "Chores");
    let task = Fact::new("Task")
        .with_field("description", "trash")
        .with_predecessor("list", list.reference().unwrap());
    let task2 = Fact::new("Task")
        .with_field("description", "dishes")
        .with_predecessor("list", list.reference().unwrap());
    let completion = Fact::new("TaskComplete")
        .with_field("completed", true)
        .with_predecessor("task", task2.reference().unwrap());
    manager
        .save_facts(vec![list.clone(), task, task2, completion])
        .unwrap();

    let list_ref = list.reference().unwrap();

    let open = open_tasks();
    let mut closed = open.clone();
    let MatchCondition::Existential(existential) = &mut closed.matches[0].conditions[1] else {
        unreachable!()
    };
    existential.exists = true;

    let open_results = manager.read(std::slice::from_ref(&list_ref), &open).unwrap();
    let closed_results = manager
        .read(std::slice::from_ref(&list_ref), &closed)
        .unwrap();

    assert_eq!(open_results.len(), 1);
    assert_eq!(closed_results.len(), 1);
    assert_ne!(open_results[0], closed_results[0]);
}
