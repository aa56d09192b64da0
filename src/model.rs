//! Document model: projects, tasks and connections.
//!
//! The persisted shape is camelCase JSON (`{ projects: [...] }` in the local
//! cache) so it round-trips with the remote store unchanged.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Display id of tasks without a stage
pub const UNASSIGNED_DISPLAY_ID: &str = "?";

const SHORT_ID_LEN: usize = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" => Some(TaskStatus::Active),
            "completed" | "done" => Some(TaskStatus::Completed),
            "archived" => Some(TaskStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            "urgent" => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub stage: Option<u32>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub rank: Option<f64>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub display_id: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>, stage: Option<u32>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            content: String::new(),
            stage,
            parent_id: None,
            order: 0,
            rank: None,
            status: TaskStatus::Active,
            x: None,
            y: None,
            display_id: String::new(),
            short_id: generate_short_id(),
            deleted_at: None,
            attachments: Vec::new(),
            tags: Vec::new(),
            priority: None,
            due_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_unassigned(&self) -> bool {
        self.stage.is_none()
    }

    /// Rank for ordering; only meaningful after a rebalance filled it in.
    pub fn rank_value(&self) -> f64 {
        self.rank.unwrap_or(0.0)
    }

    /// Whether two versions of a task differ in a user-owned field.
    /// Layout-derived fields (display id, order, position) are ignored.
    pub fn diverges_from(&self, other: &Task) -> bool {
        self.title != other.title
            || self.content != other.content
            || self.stage != other.stage
            || self.parent_id != other.parent_id
            || self.rank != other.rank
            || self.status != other.status
            || self.deleted_at != other.deleted_at
            || self.attachments != other.attachments
            || self.tags != other.tags
            || self.priority != other.priority
            || self.due_date != other.due_date
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            description,
            deleted_at: None,
            updated_at: now,
        }
    }

    /// A connection that mirrors an actual parent edge.
    pub fn is_structural(&self, project: &Project) -> bool {
        project
            .task(&self.target)
            .map(|task| task.parent_id.as_deref() == Some(self.source.as_str()))
            .unwrap_or(false)
    }

    pub fn diverges_from(&self, other: &Connection) -> bool {
        self.source != other.source
            || self.target != other.target
            || self.description != other.description
            || self.deleted_at != other.deleted_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            owner_id: None,
            tasks: Vec::new(),
            connections: Vec::new(),
            version: 0,
            updated_at: now,
        }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Live (not soft-deleted) task by id.
    pub fn active_task(&self, id: &str) -> Option<&Task> {
        self.task(id).filter(|task| !task.is_deleted())
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|task| !task.is_deleted())
    }

    /// Live tasks in `stage`, in no particular order.
    pub fn stage_tasks(&self, stage: Option<u32>) -> Vec<&Task> {
        self.active_tasks()
            .filter(|task| task.stage == stage)
            .collect()
    }

    /// Direct live children of `id`.
    pub fn children_of(&self, id: &str) -> Vec<&Task> {
        self.active_tasks()
            .filter(|task| task.parent_id.as_deref() == Some(id))
            .collect()
    }

    /// All descendant ids of `id` (live and deleted), breadth first.
    /// Terminates on corrupted parent chains.
    pub fn descendant_ids(&self, id: &str) -> Vec<String> {
        let mut by_parent: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            if let Some(parent) = task.parent_id.as_deref() {
                by_parent.entry(parent).or_default().push(task.id.as_str());
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(id);
        let mut out = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for &child in by_parent.get(current).into_iter().flatten() {
                if seen.insert(child) {
                    out.push(child.to_string());
                    frontier.push(child);
                }
            }
        }
        out
    }

    /// Whether `candidate` sits somewhere below `ancestor`.
    pub fn is_descendant(&self, ancestor: &str, candidate: &str) -> bool {
        self.descendant_ids(ancestor)
            .iter()
            .any(|id| id == candidate)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tasks: self.tasks.clone(),
            connections: self.connections.clone(),
        }
    }

    /// Replace structure and content with a snapshot, keeping identity and version.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.tasks = snapshot.tasks.clone();
        self.connections = snapshot.connections.clone();
    }
}

/// Structural capture of a project used for undo and diffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub connections: Vec<Connection>,
}

/// Full local cache payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub projects: Vec<Project>,
}

fn generate_short_id() -> String {
    let raw = Ulid::new().to_string().to_ascii_lowercase();
    // The random section follows the 10-char timestamp.
    raw.chars().rev().take(SHORT_ID_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with(tasks: Vec<Task>) -> Project {
        let mut project = Project::new("p", Utc::now());
        project.tasks = tasks;
        project
    }

    fn task(id: &str, stage: Option<u32>, parent: Option<&str>) -> Task {
        let mut task = Task::new(id, stage, Utc::now());
        task.id = id.to_string();
        task.parent_id = parent.map(str::to_string);
        task
    }

    #[test]
    fn descendants_follow_parent_chain() {
        let project = project_with(vec![
            task("a", Some(1), None),
            task("b", Some(2), Some("a")),
            task("c", Some(3), Some("b")),
            task("d", Some(1), None),
        ]);
        let mut ids = project.descendant_ids("a");
        ids.sort();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
        assert!(project.is_descendant("a", "c"));
        assert!(!project.is_descendant("c", "a"));
    }

    #[test]
    fn descendants_terminate_on_cycle() {
        let project = project_with(vec![
            task("a", Some(1), Some("b")),
            task("b", Some(2), Some("a")),
        ]);
        assert_eq!(project.descendant_ids("a"), vec!["b".to_string()]);
    }

    #[test]
    fn structural_connection_detection() {
        let project = project_with(vec![task("a", Some(1), None), task("b", Some(2), Some("a"))]);
        let now = Utc::now();
        assert!(Connection::new("a", "b", None, now).is_structural(&project));
        assert!(!Connection::new("b", "a", None, now).is_structural(&project));
    }

    #[test]
    fn divergence_ignores_layout_fields() {
        let base = task("a", Some(1), None);
        let mut other = base.clone();
        other.display_id = "7".to_string();
        other.order = 9;
        other.x = Some(1.0);
        assert!(!base.diverges_from(&other));
        other.title = "changed".to_string();
        assert!(base.diverges_from(&other));
    }

    #[test]
    fn task_json_is_camel_case() {
        let mut t = task("a", Some(1), Some("p"));
        t.display_id = "1,a".to_string();
        let json = serde_json::to_value(&t).expect("json");
        assert_eq!(json["parentId"], "p");
        assert_eq!(json["displayId"], "1,a");
        assert!(json.get("deletedAt").is_none());
        assert_eq!(t.short_id.len(), 6);
    }
}
