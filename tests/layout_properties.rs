use std::rc::Rc;

use chrono::Utc;
use stagewise::config::{Config, LayoutConfig};
use stagewise::error::Error;
use stagewise::layout::rebalance;
use stagewise::model::{Project, Task};
use stagewise::rank::{apply_refusal_strategy, compute_insert_rank};
use stagewise::store::DocumentStore;
use stagewise::timer::ManualClock;

fn task(id: &str, stage: Option<u32>, parent: Option<&str>, rank: Option<f64>) -> Task {
    let mut task = Task::new(id, stage, Utc::now());
    task.id = id.to_string();
    task.parent_id = parent.map(str::to_string);
    task.rank = rank;
    task
}

fn project(tasks: Vec<Task>) -> Project {
    let mut project = Project::new("layout", Utc::now());
    project.tasks = tasks;
    project
}

fn store() -> DocumentStore {
    let mut store = DocumentStore::new(Config::default(), Rc::new(ManualClock::default()));
    store.create_project("plan").expect("project");
    store
}

fn display(store: &DocumentStore, id: &str) -> String {
    store
        .active_project()
        .expect("project")
        .task(id)
        .expect("task")
        .display_id
        .clone()
}

#[test]
fn children_end_up_after_their_parents() {
    let layout = LayoutConfig::default();
    // Deliberately broken: children share or precede the parent's stage and rank.
    let input = project(vec![
        task("root", Some(2), None, Some(20_000.0)),
        task("same-stage", Some(2), Some("root"), Some(19_000.0)),
        task("grandchild", Some(1), Some("same-stage"), None),
        task("later", Some(5), Some("root"), Some(5.0)),
    ]);

    let out = rebalance(&input, &layout).expect("rebalance");
    for child in out.tasks.iter().filter(|task| task.parent_id.is_some()) {
        let parent = out
            .task(child.parent_id.as_deref().expect("parent"))
            .expect("parent task");
        assert!(child.stage > parent.stage, "{} stage", child.id);
        assert!(child.rank_value() > parent.rank_value(), "{} rank", child.id);
    }
}

#[test]
fn rebalance_is_idempotent() {
    let layout = LayoutConfig::default();
    let input = project(vec![
        task("b", Some(1), None, Some(10_500.0)),
        task("a", Some(1), None, Some(10_000.0)),
        task("a1", Some(2), Some("a"), None),
        task("a2", Some(2), Some("a"), None),
        task("loose", None, None, Some(3.0)),
    ]);

    let once = rebalance(&input, &layout).expect("first");
    let twice = rebalance(&once, &layout).expect("second");
    assert_eq!(once, twice);

    let ids: Vec<(&str, &str)> = once
        .tasks
        .iter()
        .map(|task| (task.id.as_str(), task.display_id.as_str()))
        .collect();
    assert!(ids.contains(&("a", "1")));
    assert!(ids.contains(&("b", "2")));
    assert!(ids.contains(&("loose", "?")));
}

#[test]
fn letters_wrap_after_twenty_six_children() {
    let layout = LayoutConfig::default();
    let mut tasks = vec![task("root", Some(1), None, Some(10_000.0))];
    for i in 0..27 {
        tasks.push(task(
            &format!("c{i:02}"),
            Some(2),
            Some("root"),
            Some(20_000.0 + f64::from(i) * 500.0),
        ));
    }

    let out = rebalance(&project(tasks), &layout).expect("rebalance");
    let id_of = |id: &str| out.task(id).expect("task").display_id.clone();
    assert_eq!(id_of("c00"), "1,a");
    assert_eq!(id_of("c25"), "1,z");
    // Known collision: the 27th child reuses the first letter.
    assert_eq!(id_of("c26"), "1,a");
}

#[test]
fn insert_rank_midpoint_and_tail() {
    let layout = LayoutConfig::default();
    let first = task("first", Some(1), None, Some(10_000.0));
    let second = task("second", Some(1), None, Some(10_500.0));
    let siblings = [&first, &second];

    let tail = compute_insert_rank(Some(1), &siblings, None, None, &layout);
    assert_eq!(tail.rank, 11_000.0);
    assert!(!tail.needs_rebalance);

    let between = compute_insert_rank(Some(1), &siblings, Some("second"), None, &layout);
    assert_eq!(between.rank, 10_250.0);
    assert!(!between.needs_rebalance);

    let empty = compute_insert_rank(Some(3), &[], None, Some(20_000.0), &layout);
    assert_eq!(empty.rank, 20_500.0);
}

#[test]
fn refusal_clamps_then_refuses() {
    let layout = LayoutConfig::default();

    let clamped = apply_refusal_strategy("t", 9_000.0, Some(10_000.0), None, &layout);
    assert!(clamped.ok);
    assert_eq!(clamped.rank, 10_500.0);

    let collapsed = apply_refusal_strategy("t", 9_000.0, Some(10_000.0), Some(10_200.0), &layout);
    assert!(!collapsed.ok);
    assert!(matches!(
        collapsed.into_result("t"),
        Err(Error::NoSpace { task_id }) if task_id == "t"
    ));
}

#[test]
fn end_to_end_display_ids() {
    let mut store = store();
    let first = store.add_task("first root", "", Some(1), None, false).expect("first");
    assert_eq!(display(&store, &first), "1");
    let second = store.add_task("second root", "", Some(1), None, false).expect("second");
    assert_eq!(display(&store, &second), "2");
    let child = store
        .add_task("child", "", Some(2), Some(&first), false)
        .expect("child");
    assert_eq!(display(&store, &child), "1,a");

    store
        .move_task_to_stage(&child, Some(2), None, Some(&second))
        .expect("move");
    assert_eq!(display(&store, &child), "2,a");
    let project = store.active_project().expect("project");
    let child_rank = project.task(&child).expect("child").rank_value();
    let second_rank = project.task(&second).expect("second").rank_value();
    assert!(child_rank > second_rank);
}

#[test]
fn moving_under_a_descendant_is_refused() {
    let mut store = store();
    let a = store.add_task("a", "", Some(1), None, false).expect("a");
    let b = store.add_task("b", "", Some(2), Some(&a), false).expect("b");
    let d = store.add_task("d", "", Some(3), Some(&b), false).expect("d");
    let before = store.active_project().expect("project").clone();
    let undo_len = store.history(&before.id).map(|h| h.undo_len());

    let err = store
        .move_task_to_stage(&a, Some(4), None, Some(&d))
        .expect_err("cycle");
    assert!(matches!(err, Error::CycleDetected { .. }));
    assert_eq!(err.code(), "LAYOUT_CYCLE_DETECTED");
    assert_eq!(store.active_project().expect("project"), &before);
    assert_eq!(store.history(&before.id).map(|h| h.undo_len()), undo_len);
}
