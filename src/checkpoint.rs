//! Project checkpoints
//!
//! Full project snapshots stored as `<timestamp>-<uuid>.json` records under
//! `.stagewise/checkpoints/`, queryable by owner and time.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::lock::{self, FileLock, DEFAULT_LOCK_TIMEOUT_MS};
use crate::model::Project;
use crate::storage::Storage;

/// A saved copy of a project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: Uuid,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
    pub project: Project,
}

impl Checkpoint {
    pub fn new(project: &Project, owner_id: Option<String>, label: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project.id.clone(),
            owner_id,
            label,
            created_at: now,
            version: project.version,
            project: project.clone(),
        }
    }

    /// One-line summary for listings
    pub fn summary(&self) -> String {
        format!(
            "{} {} project={} v{} tasks={}{}",
            self.created_at.to_rfc3339(),
            self.id,
            self.project_id,
            self.version,
            self.project.active_tasks().count(),
            self.label
                .as_deref()
                .map(|label| format!(" \"{label}\""))
                .unwrap_or_default()
        )
    }
}

/// Filter for [`CheckpointStore::list`]
#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub project_id: Option<String>,
    pub owner_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl CheckpointFilter {
    pub fn matches(&self, checkpoint: &Checkpoint) -> bool {
        if let Some(project_id) = &self.project_id {
            if &checkpoint.project_id != project_id {
                return false;
            }
        }
        if let Some(owner_id) = &self.owner_id {
            if checkpoint.owner_id.as_deref() != Some(owner_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if &checkpoint.created_at < since {
                return false;
            }
        }
        true
    }
}

/// Checkpoint directory manager
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn for_storage(storage: &Storage) -> Self {
        Self::new(storage.checkpoints_dir())
    }

    pub fn create(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let _lock = FileLock::acquire(store_lock_path(&self.dir), DEFAULT_LOCK_TIMEOUT_MS)?;

        let path = self.dir.join(checkpoint_filename(checkpoint));
        if path.exists() {
            return Err(Error::OperationFailed(format!(
                "checkpoint already exists: {}",
                path.display()
            )));
        }
        let json = serde_json::to_vec_pretty(checkpoint)?;
        lock::write_atomic(&path, &json)?;
        tracing::info!(checkpoint = %checkpoint.id, project = %checkpoint.project_id, "checkpoint created");
        Ok(path)
    }

    pub fn get(&self, id: Uuid) -> Result<Checkpoint> {
        let path = self
            .find_path(id)?
            .ok_or_else(|| Error::NotFound(format!("checkpoint {id}")))?;
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Matching checkpoints, newest first
    pub fn list(&self, filter: &CheckpointFilter, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for path in self.paths()? {
            let content = fs::read_to_string(&path)?;
            let checkpoint: Checkpoint = serde_json::from_str(&content)?;
            if filter.matches(&checkpoint) {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            checkpoints.truncate(limit);
        }
        Ok(checkpoints)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let _lock = FileLock::acquire(store_lock_path(&self.dir), DEFAULT_LOCK_TIMEOUT_MS)?;
        let path = self
            .find_path(id)?
            .ok_or_else(|| Error::NotFound(format!("checkpoint {id}")))?;
        fs::remove_file(path)?;
        Ok(())
    }

    fn paths(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn find_path(&self, id: Uuid) -> Result<Option<PathBuf>> {
        let suffix = format!("-{id}.json");
        Ok(self.paths()?.into_iter().find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(&suffix))
                .unwrap_or(false)
        }))
    }
}

fn store_lock_path(dir: &Path) -> PathBuf {
    dir.join("checkpoints.lock")
}

fn checkpoint_filename(checkpoint: &Checkpoint) -> String {
    let ts = checkpoint.created_at.format("%Y%m%dT%H%M%S%.3fZ");
    format!("{}-{}.json", ts, checkpoint.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::millis;
    use tempfile::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let temp = TempDir::new().expect("tempdir");
        let store = CheckpointStore::new(temp.path().join("checkpoints"));
        (temp, store)
    }

    #[test]
    fn create_get_delete() {
        let (_temp, store) = store();
        let project = Project::new("plan", Utc::now());
        let checkpoint = Checkpoint::new(&project, Some("alice".to_string()), Some("before import".to_string()), Utc::now());

        let path = store.create(&checkpoint).expect("create");
        assert!(path.exists());
        assert_eq!(store.get(checkpoint.id).expect("get"), checkpoint);

        store.delete(checkpoint.id).expect("delete");
        assert!(matches!(store.get(checkpoint.id), Err(Error::NotFound(_))));
        assert!(matches!(store.delete(checkpoint.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn list_filters_by_owner_and_time() {
        let (_temp, store) = store();
        let project = Project::new("plan", Utc::now());
        let t0 = Utc::now();

        let old = Checkpoint::new(&project, Some("alice".to_string()), None, t0);
        let newer = Checkpoint::new(&project, Some("alice".to_string()), None, t0 + millis(5_000));
        let other = Checkpoint::new(&project, Some("bob".to_string()), None, t0 + millis(10_000));
        for checkpoint in [&old, &newer, &other] {
            store.create(checkpoint).expect("create");
        }

        let alice = store
            .list(
                &CheckpointFilter {
                    owner_id: Some("alice".to_string()),
                    ..CheckpointFilter::default()
                },
                None,
            )
            .expect("list");
        assert_eq!(alice.iter().map(|c| c.id).collect::<Vec<_>>(), vec![newer.id, old.id]);

        let recent = store
            .list(
                &CheckpointFilter {
                    since: Some(t0 + millis(1_000)),
                    ..CheckpointFilter::default()
                },
                Some(1),
            )
            .expect("list");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, other.id);
    }

    #[test]
    fn summary_mentions_label() {
        let project = Project::new("plan", Utc::now());
        let checkpoint = Checkpoint::new(&project, None, Some("nightly".to_string()), Utc::now());
        assert!(checkpoint.summary().contains("\"nightly\""));
        assert!(checkpoint.summary().contains("tasks=0"));
    }
}
