//! Storage layer for stagewise
//!
//! All local state lives under `.stagewise/` in the planner directory.
//!
//! # Directory Structure
//!
//! ```text
//! .stagewise/
//!   cache.json                  # { projects: [...] } offline snapshot
//!   session.json                # active project id
//!   queue.json                  # pending actions + dead letters
//!   conflict.json               # rejected save awaiting a decision
//!   history/
//!     <project-id>.json         # undo/redo stacks
//!   checkpoints/
//!     <timestamp>-<uuid>.json   # project checkpoints
//!   remote/
//!     <project-id>.json         # directory remote used by the CLI
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::history::HistoryState;
use crate::lock::{self, DEFAULT_LOCK_TIMEOUT_MS};
use crate::model::{CacheSnapshot, Project};
use crate::queue::QueueState;

/// Name of the state directory
pub const STATE_DIR: &str = ".stagewise";

/// Which project commands act on by default
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_project: Option<String>,
}

/// Both sides of a rejected save, kept until the user decides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub local: Project,
    pub remote: Project,
    pub detected_at: DateTime<Utc>,
}

/// Storage manager for a planner directory
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn for_dir(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    /// Planner directory (holds `.stagewise.toml`)
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.state_dir().join("cache.json")
    }

    pub fn session_file(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.state_dir().join("queue.json")
    }

    pub fn conflict_file(&self) -> PathBuf {
        self.state_dir().join("conflict.json")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.state_dir().join("history")
    }

    pub fn history_file(&self, project_id: &str) -> PathBuf {
        self.history_dir().join(format!("{}.json", file_key(project_id)))
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir().join("checkpoints")
    }

    pub fn remote_dir(&self) -> PathBuf {
        self.state_dir().join("remote")
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.state_dir())?;
        fs::create_dir_all(self.history_dir())?;
        fs::create_dir_all(self.checkpoints_dir())?;
        fs::create_dir_all(self.remote_dir())?;
        if !self.cache_file().exists() {
            self.save_cache(&CacheSnapshot::default())?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state_dir().exists()
    }

    // =========================================================================
    // Documents
    // =========================================================================

    pub fn load_cache(&self) -> Result<CacheSnapshot> {
        Ok(lock::read_json_locked(&self.cache_file(), DEFAULT_LOCK_TIMEOUT_MS)?.unwrap_or_default())
    }

    pub fn save_cache(&self, cache: &CacheSnapshot) -> Result<()> {
        lock::write_json_locked(&self.cache_file(), cache, DEFAULT_LOCK_TIMEOUT_MS)
    }

    pub fn load_session(&self) -> Result<Session> {
        Ok(lock::read_json_locked(&self.session_file(), DEFAULT_LOCK_TIMEOUT_MS)?.unwrap_or_default())
    }

    pub fn save_session(&self, session: &Session) -> Result<()> {
        lock::write_json_locked(&self.session_file(), session, DEFAULT_LOCK_TIMEOUT_MS)
    }

    pub fn load_queue(&self) -> Result<QueueState> {
        Ok(lock::read_json_locked(&self.queue_file(), DEFAULT_LOCK_TIMEOUT_MS)?.unwrap_or_default())
    }

    pub fn save_queue(&self, state: &QueueState) -> Result<()> {
        lock::write_json_locked(&self.queue_file(), state, DEFAULT_LOCK_TIMEOUT_MS)
    }

    pub fn load_conflict(&self) -> Result<Option<ConflictRecord>> {
        lock::read_json_locked(&self.conflict_file(), DEFAULT_LOCK_TIMEOUT_MS)
    }

    /// Write the pending conflict, or remove the file when there is none.
    pub fn save_conflict(&self, record: Option<&ConflictRecord>) -> Result<()> {
        match record {
            Some(record) => lock::write_json_locked(&self.conflict_file(), record, DEFAULT_LOCK_TIMEOUT_MS),
            None => {
                let path = self.conflict_file();
                if path.exists() {
                    fs::remove_file(path)?;
                }
                Ok(())
            }
        }
    }

    pub fn load_history(&self, project_id: &str) -> Result<HistoryState> {
        Ok(lock::read_json_locked(&self.history_file(project_id), DEFAULT_LOCK_TIMEOUT_MS)?.unwrap_or_default())
    }

    pub fn save_history(&self, project_id: &str, state: &HistoryState) -> Result<()> {
        lock::write_json_locked(&self.history_file(project_id), state, DEFAULT_LOCK_TIMEOUT_MS)
    }

    pub fn remove_history(&self, project_id: &str) -> Result<()> {
        let path = self.history_file(project_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// File-name-safe form of an id.
pub fn file_key(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Ensure `.stagewise/` is in the directory's .gitignore if it is a git checkout
pub fn ensure_gitignore(root: &Path) -> io::Result<()> {
    if !root.join(".git").exists() {
        return Ok(());
    }
    let gitignore_path = root.join(".gitignore");
    let pattern = format!("/{STATE_DIR}/");
    let existing = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path)?
    } else {
        String::new()
    };

    let already_ignored = existing.lines().any(|line| {
        let trimmed = line.trim().trim_start_matches('/').trim_end_matches('/');
        trimmed == STATE_DIR
    });
    if already_ignored {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&gitignore_path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# stagewise local state")?;
    writeln!(file, "{pattern}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Project;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn paths_live_under_state_dir() {
        let temp = TempDir::new().expect("tempdir");
        let storage = Storage::for_dir(temp.path());
        assert_eq!(storage.cache_file(), temp.path().join(".stagewise/cache.json"));
        assert_eq!(
            storage.history_file("a/b"),
            temp.path().join(".stagewise/history/a_b.json")
        );
        assert!(!storage.is_initialized());
    }

    #[test]
    fn init_creates_layout_and_empty_cache() {
        let temp = TempDir::new().expect("tempdir");
        let storage = Storage::for_dir(temp.path());
        storage.init().expect("init");

        assert!(storage.is_initialized());
        assert!(storage.checkpoints_dir().is_dir());
        assert!(storage.remote_dir().is_dir());
        assert!(storage.load_cache().expect("cache").projects.is_empty());
    }

    #[test]
    fn cache_and_session_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let storage = Storage::for_dir(temp.path());
        storage.init().expect("init");

        let project = Project::new("plan", Utc::now());
        let cache = CacheSnapshot {
            projects: vec![project.clone()],
        };
        storage.save_cache(&cache).expect("save");
        assert_eq!(storage.load_cache().expect("load"), cache);

        storage
            .save_session(&Session {
                active_project: Some(project.id.clone()),
            })
            .expect("session");
        assert_eq!(
            storage.load_session().expect("session").active_project,
            Some(project.id)
        );

        let raw = fs::read_to_string(storage.cache_file()).expect("raw");
        assert!(raw.contains("\"projects\""));
        assert!(raw.contains("\"updatedAt\""));
    }

    #[test]
    fn missing_documents_default() {
        let temp = TempDir::new().expect("tempdir");
        let storage = Storage::for_dir(temp.path());
        assert!(storage.load_queue().expect("queue").actions.is_empty());
        assert!(storage.load_history("p").expect("history").undo.is_empty());
        assert_eq!(storage.load_session().expect("session"), Session::default());
    }

    #[test]
    fn conflict_file_is_removed_when_cleared() {
        let temp = TempDir::new().expect("tempdir");
        let storage = Storage::for_dir(temp.path());
        storage.init().expect("init");

        let now = Utc::now();
        let record = ConflictRecord {
            local: Project::new("plan", now),
            remote: Project::new("plan", now),
            detected_at: now,
        };
        storage.save_conflict(Some(&record)).expect("save");
        assert_eq!(storage.load_conflict().expect("load"), Some(record));

        storage.save_conflict(None).expect("clear");
        assert!(!storage.conflict_file().exists());
        assert_eq!(storage.load_conflict().expect("load"), None);
    }

    #[test]
    fn gitignore_only_in_git_checkouts() {
        let temp = TempDir::new().expect("tempdir");
        ensure_gitignore(temp.path()).expect("noop");
        assert!(!temp.path().join(".gitignore").exists());

        fs::create_dir_all(temp.path().join(".git")).expect("git dir");
        fs::write(temp.path().join(".gitignore"), "target").expect("write");
        ensure_gitignore(temp.path()).expect("append");
        ensure_gitignore(temp.path()).expect("idempotent");
        let content = fs::read_to_string(temp.path().join(".gitignore")).expect("read");
        assert_eq!(content.matches("/.stagewise/").count(), 1);
        assert!(content.starts_with("target\n"));
    }
}
