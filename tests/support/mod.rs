#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use assert_cmd::Command;
use serde_json::Value;
use stagewise::config::{Config, CONFIG_FILE};
use stagewise::remote::InMemoryRemoteStore;
use stagewise::storage::Storage;
use stagewise::store::DocumentStore;
use stagewise::sync::SyncEngine;
use stagewise::timer::ManualClock;
use tempfile::TempDir;

/// A planner directory plus a remote directory, both temporary.
pub struct TestPlanner {
    dir: TempDir,
    remote: PathBuf,
}

impl TestPlanner {
    /// Fresh, uninitialized planner with its own remote.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let remote = dir.path().join("shared-remote");
        Self { dir, remote }
    }

    /// Planner that shares `other`'s remote directory.
    pub fn sharing_remote(other: &TestPlanner) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        Self {
            dir,
            remote: other.remote.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn remote_dir(&self) -> &Path {
        &self.remote
    }

    pub fn storage(&self) -> Storage {
        Storage::for_dir(self.dir.path())
    }

    pub fn write_config(&self, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(CONFIG_FILE);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// `stagewise` pointed at this planner and its remote.
    pub fn cmd(&self) -> Command {
        let mut cmd = stagewise_cmd();
        cmd.env("STAGEWISE_DIR", self.dir.path())
            .env("STAGEWISE_REMOTE", &self.remote);
        cmd
    }

    /// Run a command with `--json`, assert success, return `data`.
    pub fn json(&self, args: &[&str]) -> Value {
        let output = self
            .cmd()
            .args(args)
            .arg("--json")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let value: Value = serde_json::from_slice(&output).expect("json envelope");
        assert_eq!(value["status"], "success", "{value}");
        value["data"].clone()
    }

    /// `init` plus a first project; returns the project id.
    pub fn init_with_project(&self, name: &str) -> String {
        self.cmd().arg("init").assert().success();
        let data = self.json(&["project", "new", name]);
        data["id"].as_str().expect("project id").to_string()
    }

    pub fn add_task(&self, args: &[&str]) -> Value {
        let mut full = vec!["task", "add"];
        full.extend_from_slice(args);
        self.json(&full)
    }
}

pub fn stagewise_cmd() -> Command {
    let mut cmd = Command::cargo_bin("stagewise").expect("binary");
    cmd.env_remove("STAGEWISE_DIR")
        .env_remove("STAGEWISE_REMOTE")
        .env_remove("STAGEWISE_OWNER")
        .env_remove("RUST_LOG");
    cmd
}

/// Library-level fixture: a sync engine over an in-memory remote with a
/// manual clock, persisting into a temporary directory.
pub struct EngineFixture {
    pub dir: TempDir,
    pub clock: Rc<ManualClock>,
    pub remote: Rc<InMemoryRemoteStore>,
    pub engine: SyncEngine,
}

impl EngineFixture {
    pub fn new() -> Self {
        Self::with_remote(Rc::new(InMemoryRemoteStore::new()))
    }

    pub fn with_remote(remote: Rc<InMemoryRemoteStore>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let clock = Rc::new(ManualClock::default());
        let engine = engine_in(dir.path(), clock.clone(), remote.clone());
        Self {
            dir,
            clock,
            remote,
            engine,
        }
    }

    pub fn project_id(&self) -> String {
        self.engine
            .store()
            .active_project_id()
            .expect("active project")
            .to_string()
    }
}

pub fn engine_in(dir: &Path, clock: Rc<ManualClock>, remote: Rc<InMemoryRemoteStore>) -> SyncEngine {
    let storage = Storage::for_dir(dir);
    storage.init().expect("init storage");
    let store = DocumentStore::new(Config::default(), clock);
    SyncEngine::new(store, remote, storage).expect("engine")
}
