//! Versioned mutation log backing undo and redo.
//!
//! Each entry stores a before/after [`Snapshot`] and the project version it
//! was recorded against. Structural edits are logged immediately; content
//! edits to the same task inside the coalesce window extend the previous
//! entry so a burst of typing is one undo step.
//!
//! Undo and redo refuse with [`Error::VersionMismatch`] once the live project
//! version has moved more than one step past the recorded one, so newer remote
//! state is never clobbered.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::HistoryConfig;
use crate::error::{Error, Result};
use crate::model::Snapshot;
use crate::timer::millis;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Structural,
    Content,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub label: String,
    pub kind: MutationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub before: Snapshot,
    pub after: Snapshot,
    pub project_version: u64,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        label: impl Into<String>,
        kind: MutationKind,
        before: Snapshot,
        after: Snapshot,
        project_version: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            kind,
            task_id: None,
            before,
            after,
            project_version,
            timestamp,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Serializable stacks, stored per project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryState {
    #[serde(default)]
    pub undo: Vec<HistoryEntry>,
    #[serde(default)]
    pub redo: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
pub struct History {
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    config: HistoryConfig,
}

impl History {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            config,
        }
    }

    pub fn from_state(state: HistoryState, config: HistoryConfig) -> Self {
        let mut history = Self::new(config);
        history.undo = state.undo.into_iter().collect();
        history.redo = state.redo;
        history.trim();
        history
    }

    pub fn state(&self) -> HistoryState {
        HistoryState {
            undo: self.undo.iter().cloned().collect(),
            redo: self.redo.clone(),
        }
    }

    /// Record a mutation. Returns `true` when it was folded into the
    /// previous entry.
    pub fn record(&mut self, entry: HistoryEntry) -> bool {
        self.redo.clear();

        if entry.kind == MutationKind::Content {
            if let Some(last) = self.undo.back_mut() {
                let window = millis(self.config.content_coalesce_ms);
                if last.kind == MutationKind::Content
                    && last.task_id == entry.task_id
                    && entry.timestamp - last.timestamp <= window
                {
                    last.after = entry.after;
                    last.timestamp = entry.timestamp;
                    return true;
                }
            }
        }

        self.undo.push_back(entry);
        self.trim();
        false
    }

    /// Pop the newest entry for undoing. The caller restores `before`.
    pub fn undo(&mut self, live_version: u64) -> Result<HistoryEntry> {
        let entry = self
            .undo
            .back()
            .ok_or_else(|| Error::NotFound("nothing to undo".to_string()))?;
        check_version(entry, live_version)?;
        let entry = self
            .undo
            .pop_back()
            .ok_or_else(|| Error::NotFound("nothing to undo".to_string()))?;
        self.redo.push(entry.clone());
        tracing::debug!(label = %entry.label, "undo");
        Ok(entry)
    }

    /// Pop the newest undone entry for redoing. The caller restores `after`.
    pub fn redo(&mut self, live_version: u64) -> Result<HistoryEntry> {
        let entry = self
            .redo
            .last()
            .ok_or_else(|| Error::NotFound("nothing to redo".to_string()))?;
        check_version(entry, live_version)?;
        let entry = self
            .redo
            .pop()
            .ok_or_else(|| Error::NotFound("nothing to redo".to_string()))?;
        self.undo.push_back(entry.clone());
        self.trim();
        tracing::debug!(label = %entry.label, "redo");
        Ok(entry)
    }

    /// Entry the next [`History::undo`] would return.
    pub fn peek_undo(&self) -> Option<&HistoryEntry> {
        self.undo.back()
    }

    pub fn peek_redo(&self) -> Option<&HistoryEntry> {
        self.redo.last()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.undo.iter()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    fn trim(&mut self) {
        while self.undo.len() > self.config.max_depth {
            self.undo.pop_front();
        }
    }
}

fn check_version(entry: &HistoryEntry, live_version: u64) -> Result<()> {
    if live_version > entry.project_version.saturating_add(1) {
        tracing::warn!(
            label = %entry.label,
            recorded = entry.project_version,
            live = live_version,
            "history entry is stale"
        );
        return Err(Error::VersionMismatch {
            expected: entry.project_version,
            actual: live_version,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    fn snapshot(title: &str) -> Snapshot {
        let mut task = Task::new(title, Some(1), Utc::now());
        task.id = "t".to_string();
        Snapshot {
            tasks: vec![task],
            connections: Vec::new(),
        }
    }

    fn history() -> History {
        History::new(HistoryConfig::default())
    }

    #[test]
    fn structural_edits_are_separate_entries() {
        let mut h = history();
        let now = Utc::now();
        h.record(HistoryEntry::new("add", MutationKind::Structural, snapshot("a"), snapshot("b"), 0, now));
        h.record(HistoryEntry::new("move", MutationKind::Structural, snapshot("b"), snapshot("c"), 0, now));
        assert_eq!(h.undo_len(), 2);
    }

    #[test]
    fn content_bursts_coalesce() {
        let mut h = history();
        let start = Utc::now();
        let edit = |before: &str, after: &str, at| {
            HistoryEntry::new("edit", MutationKind::Content, snapshot(before), snapshot(after), 0, at)
                .with_task("t")
        };

        assert!(!h.record(edit("a", "ab", start)));
        assert!(h.record(edit("ab", "abc", start + millis(400))));
        assert!(h.record(edit("abc", "abcd", start + millis(1300))));
        assert!(!h.record(edit("abcd", "abcde", start + millis(2500))));

        assert_eq!(h.undo_len(), 2);
        let first = h.entries().next().expect("entry");
        assert_eq!(first.before.tasks[0].title, "a");
        assert_eq!(first.after.tasks[0].title, "abcd");
    }

    #[test]
    fn undo_then_redo_moves_between_stacks() {
        let mut h = history();
        h.record(HistoryEntry::new("add", MutationKind::Structural, snapshot("a"), snapshot("b"), 3, Utc::now()));

        let entry = h.undo(3).expect("undo");
        assert_eq!(entry.before.tasks[0].title, "a");
        assert!(h.can_redo());
        let entry = h.redo(4).expect("redo");
        assert_eq!(entry.after.tasks[0].title, "b");
        assert!(!h.can_redo());
    }

    #[test]
    fn stale_entries_refuse() {
        let mut h = history();
        h.record(HistoryEntry::new("add", MutationKind::Structural, snapshot("a"), snapshot("b"), 3, Utc::now()));
        let err = h.undo(5).expect_err("stale");
        assert!(matches!(err, Error::VersionMismatch { expected: 3, actual: 5 }));
        assert_eq!(h.undo_len(), 1);
    }

    #[test]
    fn new_record_clears_redo_and_depth_is_capped() {
        let mut h = History::new(HistoryConfig {
            max_depth: 2,
            ..HistoryConfig::default()
        });
        let now = Utc::now();
        for title in ["a", "b", "c"] {
            h.record(HistoryEntry::new(title, MutationKind::Structural, snapshot(title), snapshot(title), 0, now));
        }
        assert_eq!(h.undo_len(), 2);
        h.undo(0).expect("undo");
        h.record(HistoryEntry::new("d", MutationKind::Structural, snapshot("d"), snapshot("d"), 0, now));
        assert!(!h.can_redo());
    }

    #[test]
    fn empty_history_reports_not_found() {
        let mut h = history();
        assert!(matches!(h.undo(0), Err(Error::NotFound(_))));
        assert!(matches!(h.redo(0), Err(Error::NotFound(_))));
    }
}
