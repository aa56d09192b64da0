//! Remote project store contract and two local implementations.
//!
//! Saves are conditional on version: the store accepts a project only when
//! its `version` is strictly greater than the stored one, and otherwise
//! answers with a conflict carrying the stored document.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, SyncError, SyncErrorKind};
use crate::lock::{self, DEFAULT_LOCK_TIMEOUT_MS};
use crate::model::Project;
use crate::storage::file_key;

pub type RemoteResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub success: bool,
    #[serde(default)]
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_data: Option<Project>,
}

impl SaveOutcome {
    pub fn saved() -> Self {
        Self {
            success: true,
            conflict: false,
            remote_data: None,
        }
    }

    pub fn conflict(remote: Project) -> Self {
        Self {
            success: false,
            conflict: true,
            remote_data: Some(remote),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RealtimeEventType {
    Insert,
    Update,
    Delete,
}

/// Change pushed by the remote for a project someone else wrote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    pub event_type: RealtimeEventType,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Project>,
}

/// Where projects are pushed to and pulled from.
pub trait RemoteStore {
    fn load_projects(&self, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<Vec<Project>>>;

    fn load_project(&self, project_id: &str) -> LocalBoxFuture<'_, RemoteResult<Option<Project>>>;

    fn save_project(&self, project: Project, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<SaveOutcome>>;

    fn delete_project(&self, project_id: &str, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<bool>>;

    /// Drain realtime events received since the last call.
    fn poll_events(&self) -> Vec<RealtimeEvent> {
        Vec::new()
    }
}

/// Apply the save contract to the stored document.
fn decide_save(
    stored: Option<&Project>,
    mut incoming: Project,
    owner_id: &str,
) -> RemoteResult<(Option<Project>, SaveOutcome)> {
    if let Some(stored) = stored {
        if let Some(owner) = stored.owner_id.as_deref() {
            if owner != owner_id {
                return Err(SyncError::business(format!(
                    "project {} belongs to {owner}",
                    stored.id
                )));
            }
        }
        if incoming.version <= stored.version {
            tracing::debug!(
                project = %stored.id,
                stored = stored.version,
                incoming = incoming.version,
                "remote rejected stale save"
            );
            return Ok((None, SaveOutcome::conflict(stored.clone())));
        }
    }
    incoming.owner_id = Some(owner_id.to_string());
    Ok((Some(incoming), SaveOutcome::saved()))
}

fn owned_by(project: &Project, owner_id: &str) -> bool {
    project.owner_id.as_deref().map(|owner| owner == owner_id).unwrap_or(true)
}

// =============================================================================
// In-memory store
// =============================================================================

/// Remote kept in memory, with failure injection for tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    projects: RefCell<HashMap<String, Project>>,
    failures: RefCell<VecDeque<SyncError>>,
    events: RefCell<VecDeque<RealtimeEvent>>,
    offline: Cell<bool>,
    saves: Cell<usize>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a project as-is, bypassing the version check.
    pub fn insert(&self, project: Project) {
        self.projects.borrow_mut().insert(project.id.clone(), project);
    }

    pub fn get(&self, project_id: &str) -> Option<Project> {
        self.projects.borrow().get(project_id).cloned()
    }

    /// Fail the next call with `err`.
    pub fn fail_next(&self, err: SyncError) {
        self.failures.borrow_mut().push_back(err);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.set(offline);
    }

    /// Queue a realtime event for the next [`RemoteStore::poll_events`].
    pub fn emit(&self, event: RealtimeEvent) {
        self.events.borrow_mut().push_back(event);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.get()
    }

    fn check(&self) -> RemoteResult<()> {
        if self.offline.get() {
            return Err(SyncError::network("remote unreachable"));
        }
        match self.failures.borrow_mut().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn load_projects(&self, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<Vec<Project>>> {
        let result = self.check().map(|()| {
            let mut projects: Vec<Project> = self
                .projects
                .borrow()
                .values()
                .filter(|project| owned_by(project, owner_id))
                .cloned()
                .collect();
            projects.sort_by(|a, b| a.id.cmp(&b.id));
            projects
        });
        future::ready(result).boxed_local()
    }

    fn load_project(&self, project_id: &str) -> LocalBoxFuture<'_, RemoteResult<Option<Project>>> {
        let result = self.check().map(|()| self.get(project_id));
        future::ready(result).boxed_local()
    }

    fn save_project(&self, project: Project, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<SaveOutcome>> {
        let result = self.check().and_then(|()| {
            let stored = self.get(&project.id);
            let (accepted, outcome) = decide_save(stored.as_ref(), project, owner_id)?;
            if let Some(accepted) = accepted {
                self.insert(accepted);
                self.saves.set(self.saves.get() + 1);
            }
            Ok(outcome)
        });
        future::ready(result).boxed_local()
    }

    fn delete_project(&self, project_id: &str, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<bool>> {
        let result = self.check().and_then(|()| {
            let mut projects = self.projects.borrow_mut();
            match projects.get(project_id) {
                None => Ok(false),
                Some(project) if !owned_by(project, owner_id) => Err(SyncError::business(format!(
                    "project {project_id} belongs to another owner"
                ))),
                Some(_) => Ok(projects.remove(project_id).is_some()),
            }
        });
        future::ready(result).boxed_local()
    }

    fn poll_events(&self) -> Vec<RealtimeEvent> {
        self.events.borrow_mut().drain(..).collect()
    }
}

// =============================================================================
// Directory store
// =============================================================================

/// Remote backed by a directory of `<project-id>.json` files, so the whole
/// protocol can be exercised without a network. Several planner
/// directories may point at the same remote directory.
#[derive(Debug, Clone)]
pub struct DirRemoteStore {
    dir: PathBuf,
}

impl DirRemoteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn project_file(&self, project_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_key(project_id)))
    }

    fn read(&self, project_id: &str) -> RemoteResult<Option<Project>> {
        lock::read_json_locked(&self.project_file(project_id), DEFAULT_LOCK_TIMEOUT_MS).map_err(to_sync_error)
    }

    fn read_all(&self, owner_id: &str) -> RemoteResult<Vec<Project>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|err| to_sync_error(err.into()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut projects = Vec::new();
        for path in paths {
            let project: Option<Project> =
                lock::read_json_locked(&path, DEFAULT_LOCK_TIMEOUT_MS).map_err(to_sync_error)?;
            if let Some(project) = project.filter(|project| owned_by(project, owner_id)) {
                projects.push(project);
            }
        }
        Ok(projects)
    }

    fn write(&self, project: Project, owner_id: &str) -> RemoteResult<SaveOutcome> {
        let path = self.project_file(&project.id);
        let decided = lock::update_json_locked::<Project, _>(&path, DEFAULT_LOCK_TIMEOUT_MS, |stored| {
            match decide_save(stored.as_ref(), project, owner_id) {
                Ok((Some(accepted), outcome)) => Ok((Some(accepted), Ok(outcome))),
                Ok((None, outcome)) => Ok((stored, Ok(outcome))),
                Err(err) => Ok((stored, Err(err))),
            }
        });
        decided.map_err(to_sync_error)?
    }

    fn remove(&self, project_id: &str, owner_id: &str) -> RemoteResult<bool> {
        let path = self.project_file(project_id);
        let removed = lock::update_json_locked::<Project, _>(&path, DEFAULT_LOCK_TIMEOUT_MS, |stored| match stored {
            None => Ok((None, Ok(false))),
            Some(project) if !owned_by(&project, owner_id) => Ok((
                Some(project),
                Err(SyncError::business(format!(
                    "project {project_id} belongs to another owner"
                ))),
            )),
            Some(_) => Ok((None, Ok(true))),
        });
        removed.map_err(to_sync_error)?
    }
}

impl RemoteStore for DirRemoteStore {
    fn load_projects(&self, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<Vec<Project>>> {
        future::ready(self.read_all(owner_id)).boxed_local()
    }

    fn load_project(&self, project_id: &str) -> LocalBoxFuture<'_, RemoteResult<Option<Project>>> {
        future::ready(self.read(project_id)).boxed_local()
    }

    fn save_project(&self, project: Project, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<SaveOutcome>> {
        future::ready(self.write(project, owner_id)).boxed_local()
    }

    fn delete_project(&self, project_id: &str, owner_id: &str) -> LocalBoxFuture<'_, RemoteResult<bool>> {
        future::ready(self.remove(project_id, owner_id)).boxed_local()
    }
}

fn to_sync_error(err: Error) -> SyncError {
    let kind = match &err {
        Error::LockFailed(_) => SyncErrorKind::Timeout,
        Error::Json(_) => SyncErrorKind::Business,
        Error::Remote(inner) => inner.kind,
        _ => SyncErrorKind::Unknown,
    };
    SyncError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn project(version: u64) -> Project {
        let mut project = Project::new("plan", Utc::now());
        project.id = "p".to_string();
        project.version = version;
        project
    }

    async fn exercise_contract(remote: &dyn RemoteStore) {
        let outcome = remote.save_project(project(1), "alice").await.expect("save");
        assert!(outcome.success);

        let outcome = remote.save_project(project(1), "alice").await.expect("stale save");
        assert!(outcome.conflict);
        assert_eq!(outcome.remote_data.expect("remote").version, 1);

        let outcome = remote.save_project(project(2), "alice").await.expect("save");
        assert!(outcome.success);

        let err = remote.save_project(project(3), "bob").await.expect_err("foreign owner");
        assert_eq!(err.kind, SyncErrorKind::Business);

        let stored = remote.load_project("p").await.expect("load").expect("exists");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.owner_id.as_deref(), Some("alice"));
        assert_eq!(remote.load_projects("alice").await.expect("list").len(), 1);
        assert!(remote.load_projects("bob").await.expect("list").is_empty());

        assert!(remote.delete_project("p", "alice").await.expect("delete"));
        assert!(!remote.delete_project("p", "alice").await.expect("delete again"));
        assert!(remote.load_project("p").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn in_memory_store_honors_version_contract() {
        let remote = InMemoryRemoteStore::new();
        exercise_contract(&remote).await;
        assert_eq!(remote.save_count(), 2);
    }

    #[tokio::test]
    async fn dir_store_honors_version_contract() {
        let temp = TempDir::new().expect("tempdir");
        let remote = DirRemoteStore::new(temp.path().join("remote"));
        exercise_contract(&remote).await;
    }

    #[tokio::test]
    async fn injected_failures_surface_once() {
        let remote = InMemoryRemoteStore::new();
        remote.fail_next(SyncError::timeout("slow"));
        let err = remote.load_project("p").await.expect_err("timeout");
        assert_eq!(err.kind, SyncErrorKind::Timeout);
        assert!(remote.load_project("p").await.expect("load").is_none());

        remote.set_offline(true);
        let err = remote.save_project(project(1), "alice").await.expect_err("offline");
        assert_eq!(err.kind, SyncErrorKind::Network);
    }

    #[test]
    fn events_drain_in_order() {
        let remote = InMemoryRemoteStore::new();
        for event_type in [RealtimeEventType::Insert, RealtimeEventType::Delete] {
            remote.emit(RealtimeEvent {
                event_type,
                project_id: "p".to_string(),
                task_id: None,
                data: None,
            });
        }
        let events = remote.poll_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, RealtimeEventType::Delete);
        assert!(remote.poll_events().is_empty());
        let json = serde_json::to_value(&events[0]).expect("json");
        assert_eq!(json["eventType"], "INSERT");
    }
}
