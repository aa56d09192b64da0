//! Version conflict detection and three-way-free project merge.
//!
//! A conflict is raised when the remote rejects a save because it already
//! holds a newer version. The merge is additive: entities present on one side
//! only are kept, entities present on both sides take the side with the newer
//! `updated_at` (remote on ties). Every entity where both sides differ in a
//! user-owned field counts toward `conflict_count`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LayoutConfig;
use crate::error::{Error, Result};
use crate::layout::rebalance_in_place;
use crate::model::{Connection, Project, Task};
use crate::sanitize::sanitize;

// =============================================================================
// Merge
// =============================================================================

/// Which document an entity was taken from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Connection,
}

/// An entity both sides changed differently.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntityConflict {
    pub kind: EntityKind,
    pub id: String,
    pub winner: Side,
}

/// Result of [`merge_projects`].
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub project: Project,
    pub conflict_count: usize,
    pub conflicts: Vec<EntityConflict>,
    pub local_only: usize,
    pub remote_only: usize,
}

/// Merge `local` and `remote` into a new, rebalanced project whose version is
/// one past the newer of the two.
pub fn merge_projects(local: &Project, remote: &Project, layout: &LayoutConfig) -> Result<MergeOutcome> {
    if local.id != remote.id {
        return Err(Error::Validation(format!(
            "cannot merge project {} with {}",
            local.id, remote.id
        )));
    }

    let mut conflicts = Vec::new();
    let tasks = merge_entities(
        &local.tasks,
        &remote.tasks,
        EntityKind::Task,
        task_id,
        |task: &Task| task.updated_at,
        Task::diverges_from,
        &mut conflicts,
    );
    let connections = merge_entities(
        &local.connections,
        &remote.connections,
        EntityKind::Connection,
        connection_id,
        |connection: &Connection| connection.updated_at,
        Connection::diverges_from,
        &mut conflicts,
    );

    let newer_meta = if local.updated_at > remote.updated_at {
        local
    } else {
        remote
    };
    let mut project = Project {
        id: local.id.clone(),
        name: newer_meta.name.clone(),
        owner_id: newer_meta.owner_id.clone().or_else(|| local.owner_id.clone()),
        tasks: tasks.merged,
        connections: connections.merged,
        version: local.version.max(remote.version) + 1,
        updated_at: local.updated_at.max(remote.updated_at),
    };

    sanitize(&mut project)?;
    rebalance_in_place(&mut project, layout)?;

    let conflict_count = conflicts.len();
    if conflict_count > 0 {
        tracing::info!(
            project = %project.id,
            conflict_count,
            local_version = local.version,
            remote_version = remote.version,
            "merge found conflicting edits"
        );
    }

    Ok(MergeOutcome {
        project,
        conflict_count,
        conflicts,
        local_only: tasks.local_only + connections.local_only,
        remote_only: tasks.remote_only + connections.remote_only,
    })
}

fn task_id(task: &Task) -> &str {
    &task.id
}

fn connection_id(connection: &Connection) -> &str {
    &connection.id
}

struct Merged<T> {
    merged: Vec<T>,
    local_only: usize,
    remote_only: usize,
}

fn merge_entities<T: Clone>(
    local: &[T],
    remote: &[T],
    kind: EntityKind,
    id_of: impl Fn(&T) -> &str,
    updated_of: impl Fn(&T) -> DateTime<Utc>,
    diverges: impl Fn(&T, &T) -> bool,
    conflicts: &mut Vec<EntityConflict>,
) -> Merged<T> {
    let remote_by_id: HashMap<&str, &T> = remote.iter().map(|item| (id_of(item), item)).collect();
    let mut merged = Vec::with_capacity(local.len().max(remote.len()));
    let mut local_only = 0;

    for item in local {
        let id = id_of(item);
        match remote_by_id.get(id) {
            None => {
                local_only += 1;
                merged.push(item.clone());
            }
            Some(&theirs) => {
                let winner = if updated_of(item) > updated_of(theirs) {
                    Side::Local
                } else {
                    Side::Remote
                };
                if diverges(item, theirs) {
                    conflicts.push(EntityConflict {
                        kind,
                        id: id.to_string(),
                        winner,
                    });
                }
                merged.push(match winner {
                    Side::Local => item.clone(),
                    Side::Remote => theirs.clone(),
                });
            }
        }
    }

    let local_ids: HashSet<&str> = local.iter().map(&id_of).collect();
    let mut remote_only = 0;
    for item in remote {
        if !local_ids.contains(id_of(item)) {
            remote_only += 1;
            merged.push(item.clone());
        }
    }

    Merged {
        merged,
        local_only,
        remote_only,
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// User-facing choice for a pending conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Local,
    Remote,
    Merge,
}

impl Resolution {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" | "mine" => Some(Resolution::Local),
            "remote" | "theirs" => Some(Resolution::Remote),
            "merge" => Some(Resolution::Merge),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
        };
        f.write_str(label)
    }
}

/// A rejected save waiting for a decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingConflict {
    pub project_id: String,
    pub local: Project,
    pub remote: Project,
    pub merged: MergeOutcome,
    pub detected_at: DateTime<Utc>,
}

impl PendingConflict {
    pub fn detect(
        local: &Project,
        remote: &Project,
        layout: &LayoutConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let merged = merge_projects(local, remote, layout)?;
        Ok(Self {
            project_id: local.id.clone(),
            local: local.clone(),
            remote: remote.clone(),
            merged,
            detected_at: now,
        })
    }

    pub fn conflict_count(&self) -> usize {
        self.merged.conflict_count
    }

    /// Produce the project to adopt for `choice`.
    pub fn resolve(&self, choice: Resolution, layout: &LayoutConfig) -> Result<Resolved> {
        let bumped = self.local.version.max(self.remote.version) + 1;
        let resolved = match choice {
            Resolution::Remote => Resolved {
                project: self.remote.clone(),
                push: false,
            },
            Resolution::Local => {
                let mut project = self.local.clone();
                project.version = bumped;
                rebalance_in_place(&mut project, layout)?;
                Resolved { project, push: true }
            }
            Resolution::Merge => Resolved {
                project: self.merged.project.clone(),
                push: true,
            },
        };
        tracing::info!(project = %self.project_id, %choice, push = resolved.push, "conflict resolved");
        Ok(resolved)
    }
}

/// Project to adopt after a resolution, and whether it must be re-pushed.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub project: Project,
    pub push: bool,
}
