mod support;

use predicates::str::contains;
use serde_json::Value;

use support::{stagewise_cmd, TestPlanner};

fn stage_tasks(list: &Value) -> Vec<(String, String)> {
    let mut tasks = Vec::new();
    for stage in list["stages"].as_array().expect("stages") {
        for task in stage["tasks"].as_array().expect("tasks") {
            tasks.push((
                task["title"].as_str().expect("title").to_string(),
                task["display_id"].as_str().expect("display id").to_string(),
            ));
        }
    }
    tasks
}

fn task_id(data: &Value) -> String {
    data["task_id"].as_str().expect("task id").to_string()
}

#[test]
fn stagewise_help_works() {
    stagewise_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("hierarchical stage planner"));
}

#[test]
fn subcommand_help_works() {
    let subcommands = [
        "init",
        "project",
        "task",
        "link",
        "undo",
        "redo",
        "queue",
        "sync",
        "checkpoint",
    ];

    for cmd in subcommands {
        stagewise_cmd().arg(cmd).arg("--help").assert().success();
    }
}

#[test]
fn uninitialized_dir_reports_json_error() -> Result<(), Box<dyn std::error::Error>> {
    let planner = TestPlanner::new();
    let output = planner
        .cmd()
        .args(["task", "list", "--json"])
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let value: Value = serde_json::from_slice(&output)?;
    assert_eq!(value["status"], "error");
    assert_eq!(value["command"], "task list");
    assert_eq!(value["error"]["kind"], "user_error");
    assert!(value["error"]["message"]
        .as_str()
        .unwrap_or_default()
        .contains("stagewise init"));
    Ok(())
}

#[test]
fn tasks_get_display_ids_by_stage_and_parent() {
    let planner = TestPlanner::new();
    planner.init_with_project("launch");

    let first = planner.add_task(&["design", "--stage", "1"]);
    assert_eq!(first["display_id"], "1");
    let second = planner.add_task(&["budget", "--stage", "1"]);
    assert_eq!(second["display_id"], "2");
    let child = planner.add_task(&["mockups", "--parent", "1"]);
    assert_eq!(child["display_id"], "1,a");
    assert_eq!(child["stage"], 2);

    let list = planner.json(&["task", "list"]);
    assert_eq!(list["total"], 3);
    let tasks = stage_tasks(&list);
    assert!(tasks.contains(&("design".to_string(), "1".to_string())));
    assert!(tasks.contains(&("budget".to_string(), "2".to_string())));
    assert!(tasks.contains(&("mockups".to_string(), "1,a".to_string())));
}

#[test]
fn moving_a_task_under_its_descendant_exits_with_layout_code() {
    let planner = TestPlanner::new();
    planner.init_with_project("launch");
    let root = task_id(&planner.add_task(&["root", "--stage", "1"]));
    let child = task_id(&planner.add_task(&["child", "--parent", &root]));

    planner
        .cmd()
        .args(["task", "move", &root, "--stage", "4", "--parent", &child])
        .assert()
        .code(3);

    let list = planner.json(&["task", "list"]);
    let tasks = stage_tasks(&list);
    assert!(tasks.contains(&("root".to_string(), "1".to_string())));
    assert!(tasks.contains(&("child".to_string(), "1,a".to_string())));
}

#[test]
fn undo_and_redo_survive_between_invocations() {
    let planner = TestPlanner::new();
    planner.init_with_project("launch");
    planner.add_task(&["keep", "--stage", "1"]);
    planner.add_task(&["oops", "--stage", "1"]);

    let undone = planner.json(&["undo"]);
    assert_eq!(undone["can_redo"], true);
    let titles: Vec<String> = stage_tasks(&planner.json(&["task", "list"]))
        .into_iter()
        .map(|(title, _)| title)
        .collect();
    assert_eq!(titles, vec!["keep"]);

    planner.json(&["redo"]);
    let list = planner.json(&["task", "list"]);
    assert_eq!(list["total"], 2);
}

#[test]
fn edits_queue_offline_and_push_to_a_shared_remote() {
    let alice = TestPlanner::new();
    alice.init_with_project("trip");
    alice.add_task(&["pack", "--stage", "1"]);
    alice.add_task(&["book flights", "--stage", "1"]);

    let queue = alice.json(&["queue", "list"]);
    assert_eq!(queue["actions"].as_array().map(Vec::len), Some(1));

    let pushed = alice.json(&["sync", "push"]);
    assert_eq!(pushed["acked"], 1);
    let queue = alice.json(&["queue", "list"]);
    assert_eq!(queue["actions"].as_array().map(Vec::len), Some(0));

    let bob = TestPlanner::sharing_remote(&alice);
    bob.cmd().arg("init").assert().success();
    let pulled = bob.json(&["sync", "pull"]);
    assert_eq!(pulled["adopted"], 1);

    let tasks = stage_tasks(&bob.json(&["task", "list"]));
    assert!(tasks.contains(&("pack".to_string(), "1".to_string())));
    assert!(tasks.contains(&("book flights".to_string(), "2".to_string())));
}

#[test]
fn checkpoint_restore_brings_back_deleted_work() {
    let planner = TestPlanner::new();
    planner.init_with_project("launch");
    let task = task_id(&planner.add_task(&["draft", "--stage", "1"]));

    let checkpoint = planner.json(&["checkpoint", "create", "--label", "before cleanup"]);
    let checkpoint_id = checkpoint["id"].as_str().expect("checkpoint id").to_string();
    assert_eq!(checkpoint["tasks"], 1);

    planner.json(&["task", "delete", &task]);
    assert_eq!(planner.json(&["task", "list"])["total"], 0);

    let listed = planner.json(&["checkpoint", "list"]);
    assert_eq!(listed["total"], 1);

    planner.json(&["checkpoint", "restore", &checkpoint_id]);
    let tasks = stage_tasks(&planner.json(&["task", "list"]));
    assert_eq!(tasks, vec![("draft".to_string(), "1".to_string())]);
}

#[test]
fn invalid_config_is_reported() {
    let planner = TestPlanner::new();
    planner.init_with_project("launch");
    planner
        .write_config("[layout]\nrank_step = -5.0\n")
        .expect("write config");

    planner.cmd().args(["task", "list"]).assert().code(2);
}
