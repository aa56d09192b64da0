//! Best-effort repair of documents loaded from disk or the remote.
//!
//! Runs before the first rebalance of a loaded project. Anything that can be
//! fixed by detaching or dropping an edge is fixed and reported; anything that
//! would lose tasks (duplicate ids) rejects the project instead.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::layout::detect_cycle;
use crate::model::Project;

/// One repair applied by [`sanitize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Repair {
    DanglingParent { task_id: String, parent_id: String },
    UnstagedParent { task_id: String, parent_id: String },
    UnassignedWithParent { task_id: String },
    CycleBroken { task_id: String },
    ConnectionDropped { connection_id: String, reason: String },
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::DanglingParent { task_id, parent_id } => {
                write!(f, "{task_id}: parent {parent_id} missing, detached")
            }
            Repair::UnstagedParent { task_id, parent_id } => {
                write!(f, "{task_id}: parent {parent_id} has no stage, detached")
            }
            Repair::UnassignedWithParent { task_id } => {
                write!(f, "{task_id}: unassigned task had a parent, detached")
            }
            Repair::CycleBroken { task_id } => write!(f, "{task_id}: parent loop broken"),
            Repair::ConnectionDropped {
                connection_id,
                reason,
            } => write!(f, "connection {connection_id} dropped: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SanitizeReport {
    pub repairs: Vec<Repair>,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty()
    }
}

/// Repair `project` in place.
pub fn sanitize(project: &mut Project) -> Result<SanitizeReport> {
    let mut seen: HashSet<&str> = HashSet::new();
    for task in &project.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(Error::Validation(format!(
                "project {} contains duplicate task id {}",
                project.id, task.id
            )));
        }
    }

    let mut report = SanitizeReport::default();
    repair_parents(project, &mut report);

    while let Some(task_id) = detect_cycle(project) {
        if let Some(task) = project.task_mut(&task_id) {
            task.parent_id = None;
        }
        report.repairs.push(Repair::CycleBroken { task_id });
    }

    repair_connections(project, &mut report);

    if !report.is_clean() {
        tracing::warn!(
            project = %project.id,
            repairs = report.repairs.len(),
            "sanitized project on load"
        );
    }
    Ok(report)
}

fn repair_parents(project: &mut Project, report: &mut SanitizeReport) {
    let live: HashMap<String, bool> = project
        .active_tasks()
        .map(|task| (task.id.clone(), task.stage.is_some()))
        .collect();
    let parent_state = |id: &str| live.get(id).copied();

    for task in project.tasks.iter_mut().filter(|task| !task.is_deleted()) {
        let Some(parent_id) = task.parent_id.clone() else {
            continue;
        };
        let repair = if task.stage.is_none() {
            Repair::UnassignedWithParent {
                task_id: task.id.clone(),
            }
        } else {
            match parent_state(&parent_id) {
                Some(true) => continue,
                Some(false) => Repair::UnstagedParent {
                    task_id: task.id.clone(),
                    parent_id,
                },
                None => Repair::DanglingParent {
                    task_id: task.id.clone(),
                    parent_id,
                },
            }
        };
        task.parent_id = None;
        report.repairs.push(repair);
    }
}

fn repair_connections(project: &mut Project, report: &mut SanitizeReport) {
    let task_ids: HashSet<String> = project.tasks.iter().map(|task| task.id.clone()).collect();
    let mut connection_ids: HashSet<String> = HashSet::new();

    project.connections.retain(|connection| {
        let reason = if connection.source == connection.target {
            Some("self loop")
        } else if !task_ids.contains(&connection.source) || !task_ids.contains(&connection.target) {
            Some("missing endpoint")
        } else if !connection_ids.insert(connection.id.clone()) {
            Some("duplicate id")
        } else {
            None
        };
        match reason {
            Some(reason) => {
                report.repairs.push(Repair::ConnectionDropped {
                    connection_id: connection.id.clone(),
                    reason: reason.to_string(),
                });
                false
            }
            None => true,
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Connection, Task};
    use chrono::Utc;

    fn task(id: &str, stage: Option<u32>, parent: Option<&str>) -> Task {
        let mut task = Task::new(id, stage, Utc::now());
        task.id = id.to_string();
        task.parent_id = parent.map(str::to_string);
        task
    }

    fn project(tasks: Vec<Task>) -> Project {
        let mut project = Project::new("p", Utc::now());
        project.tasks = tasks;
        project
    }

    #[test]
    fn clean_project_is_untouched() {
        let mut p = project(vec![task("a", Some(1), None), task("b", Some(2), Some("a"))]);
        let before = p.clone();
        let report = sanitize(&mut p).expect("sanitize");
        assert!(report.is_clean());
        assert_eq!(p, before);
    }

    #[test]
    fn duplicate_ids_reject_the_project() {
        let mut p = project(vec![task("a", Some(1), None), task("a", Some(2), None)]);
        assert!(matches!(sanitize(&mut p), Err(Error::Validation(_))));
    }

    #[test]
    fn broken_parents_are_detached() {
        let mut p = project(vec![
            task("loose", None, None),
            task("orphan", Some(2), Some("missing")),
            task("under_loose", Some(2), Some("loose")),
            task("unassigned_child", None, Some("orphan")),
        ]);
        let report = sanitize(&mut p).expect("sanitize");
        assert_eq!(report.repairs.len(), 3);
        assert!(p.tasks.iter().all(|task| task.parent_id.is_none()));
        assert!(report.repairs.contains(&Repair::DanglingParent {
            task_id: "orphan".to_string(),
            parent_id: "missing".to_string(),
        }));
    }

    #[test]
    fn large_projects_check_parents_by_lookup() {
        let mut tasks = Vec::new();
        for i in 0..10_000 {
            tasks.push(task(&format!("p{i}"), Some(1), None));
            let parent = if i % 2 == 0 { format!("p{i}") } else { format!("gone{i}") };
            tasks.push(task(&format!("c{i}"), Some(2), Some(parent.as_str())));
        }
        let mut p = project(tasks);

        let started = std::time::Instant::now();
        let report = sanitize(&mut p).expect("sanitize");
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(report.repairs.len(), 5_000);
        assert_eq!(p.task("c0").and_then(|t| t.parent_id.as_deref()), Some("p0"));
        assert_eq!(p.task("c1").and_then(|t| t.parent_id.as_deref()), None);
    }

    #[test]
    fn cycles_are_broken() {
        let mut p = project(vec![
            task("a", Some(1), Some("c")),
            task("b", Some(2), Some("a")),
            task("c", Some(3), Some("b")),
        ]);
        let report = sanitize(&mut p).expect("sanitize");
        assert_eq!(report.repairs.len(), 1);
        assert!(detect_cycle(&p).is_none());
        assert_eq!(p.tasks.iter().filter(|task| task.parent_id.is_none()).count(), 1);
    }

    #[test]
    fn bad_connections_are_dropped() {
        let mut p = project(vec![task("a", Some(1), None), task("b", Some(1), None)]);
        let now = Utc::now();
        let good = Connection::new("a", "b", None, now);
        let mut dup = good.clone();
        dup.description = Some("again".to_string());
        p.connections = vec![
            good,
            Connection::new("a", "a", None, now),
            Connection::new("a", "zzz", None, now),
            dup,
        ];
        let report = sanitize(&mut p).expect("sanitize");
        assert_eq!(p.connections.len(), 1);
        assert_eq!(report.repairs.len(), 3);
    }
}
