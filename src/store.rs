//! In-memory document store.
//!
//! [`DocumentStore`] owns every loaded project and is the only place they
//! change. A mutation runs on a draft copy, goes through
//! [`rebalance_in_place`], is recorded in the project's history and only then
//! replaces the live document. A failed operation leaves nothing behind.
//!
//! Subscribers hear about every committed change. The store never touches
//! disk or network; timers it owns come back out of [`DocumentStore::tick`]
//! for the sync layer to act on.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Config, LayoutConfig};
use crate::coordinator::StageRebalanceCoordinator;
use crate::error::{Error, Result};
use crate::history::{History, HistoryEntry, HistoryState, MutationKind};
use crate::layout::{min_child_rank, rebalance_in_place, would_create_cycle};
use crate::model::{Connection, Project, Task, TaskPriority, TaskStatus};
use crate::rank::{apply_refusal_strategy, compare_by_rank, compute_insert_rank, reorder_stage_ranks, stage_label};
use crate::sanitize::{sanitize, SanitizeReport};
use crate::timer::{Clock, Scheduler, TimerKey};

/// Live tasks of the active project grouped by stage, each group in rank order.
pub type StageView = BTreeMap<Option<u32>, Vec<Task>>;

/// Notification sent to subscribers after a committed change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    ProjectChanged { project_id: String, label: String },
    ProjectSelected { project_id: String },
    ProjectReplaced { project_id: String },
    ProjectRemoved { project_id: String },
    StagesRebalanced { project_id: String, stages: Vec<Option<u32>> },
    EditingEnded,
}

type Listener = Rc<dyn Fn(&StoreEvent)>;

/// Keeps a subscriber registered; dropping it unsubscribes.
pub struct Subscription {
    _listener: Listener,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Field edits for [`DocumentStore::update_task_fields`]. `None` leaves a
/// field alone; the nested options clear a field with `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct TaskFields {
    pub title: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Option<TaskPriority>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub tags: Option<Vec<String>>,
}

impl TaskFields {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.due_date.is_none()
            && self.tags.is_none()
    }
}

/// Result of [`DocumentStore::load_projects`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub repairs: Vec<String>,
    pub rejected: Vec<String>,
}

struct EditContext {
    layout: LayoutConfig,
    now: DateTime<Utc>,
    crowded: Vec<Option<u32>>,
}

struct Placement {
    stage: Option<u32>,
    parent_id: Option<String>,
    before_id: Option<String>,
}

pub struct DocumentStore {
    config: Config,
    clock: Rc<dyn Clock>,
    projects: Vec<Project>,
    active: Option<String>,
    histories: HashMap<String, History>,
    coordinator: StageRebalanceCoordinator,
    scheduler: Scheduler,
    editing: bool,
    dirty: BTreeSet<String>,
    stage_view: RefCell<Option<Rc<StageView>>>,
    listeners: RefCell<Vec<Weak<dyn Fn(&StoreEvent)>>>,
}

impl DocumentStore {
    pub fn new(config: Config, clock: Rc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            projects: Vec::new(),
            active: None,
            histories: HashMap::new(),
            coordinator: StageRebalanceCoordinator::new(),
            scheduler: Scheduler::new(),
            editing: false,
            dirty: BTreeSet::new(),
            stage_view: RefCell::new(None),
            listeners: RefCell::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub fn projects(&self) -> &[Project] {
        &self.projects
    }

    pub fn project(&self, project_id: &str) -> Option<&Project> {
        self.projects.iter().find(|project| project.id == project_id)
    }

    pub fn active_project_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_project(&self) -> Result<&Project> {
        let id = self
            .active
            .as_deref()
            .ok_or_else(|| Error::NotFound("no active project".to_string()))?;
        self.project(id)
            .ok_or_else(|| Error::NotFound(format!("project {id}")))
    }

    /// Create an empty project and make it active.
    pub fn create_project(&mut self, name: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("project name cannot be empty".to_string()));
        }
        let now = self.clock.now();
        let project = Project::new(name, now);
        let id = project.id.clone();
        self.projects.push(project);
        tracing::info!(project = %id, name, "project created");
        self.select_project(&id)?;
        self.touch(&id, now);
        Ok(id)
    }

    pub fn select_project(&mut self, project_id: &str) -> Result<()> {
        if self.project(project_id).is_none() {
            return Err(Error::NotFound(format!("project {project_id}")));
        }
        if self.active.as_deref() == Some(project_id) {
            return Ok(());
        }
        // Pending stage work belongs to the project being left.
        self.perform_stage_rebalance(self.clock.now());
        self.active = Some(project_id.to_string());
        self.invalidate_view();
        self.notify(&StoreEvent::ProjectSelected {
            project_id: project_id.to_string(),
        });
        Ok(())
    }

    /// Load projects from the local cache. Each one is sanitized and
    /// rebalanced; projects that cannot be repaired are reported and skipped.
    pub fn load_projects(&mut self, projects: Vec<Project>) -> LoadReport {
        let mut report = LoadReport::default();
        for project in projects {
            let project_id = project.id.clone();
            match prepare_incoming(project, &self.config.layout) {
                Ok((project, repairs)) => {
                    report
                        .repairs
                        .extend(repairs.repairs.iter().map(|repair| format!("{project_id}: {repair}")));
                    self.insert_or_replace(project);
                    report.loaded += 1;
                }
                Err(err) => {
                    tracing::warn!(project = %project_id, error = %err, "project rejected on load");
                    report.rejected.push(format!("{project_id}: {err}"));
                }
            }
        }
        if self.active.is_none() {
            self.active = self.projects.first().map(|project| project.id.clone());
        }
        self.invalidate_view();
        report
    }

    /// Replace (or add) a project with a document that came from elsewhere:
    /// the remote, a conflict resolution or a checkpoint. Not recorded in
    /// history; clears the project's pending local changes.
    pub fn adopt_project(&mut self, project: Project) -> Result<SanitizeReport> {
        let (project, report) = prepare_incoming(project, &self.config.layout)?;
        let project_id = project.id.clone();
        self.insert_or_replace(project);
        self.dirty.remove(&project_id);
        if self.active.is_none() {
            self.active = Some(project_id.clone());
        }
        self.invalidate_view();
        self.notify(&StoreEvent::ProjectReplaced { project_id });
        Ok(report)
    }

    pub fn remove_project(&mut self, project_id: &str) -> Result<Project> {
        let index = self
            .projects
            .iter()
            .position(|project| project.id == project_id)
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        let removed = self.projects.remove(index);
        self.histories.remove(project_id);
        self.dirty.remove(project_id);
        if self.active.as_deref() == Some(project_id) {
            self.coordinator.reset();
            self.scheduler.cancel(TimerKey::StageRebalance);
            self.active = self.projects.first().map(|project| project.id.clone());
        }
        self.invalidate_view();
        self.notify(&StoreEvent::ProjectRemoved {
            project_id: project_id.to_string(),
        });
        Ok(removed)
    }

    /// Record that the remote accepted `version` for this project.
    pub fn acknowledge(&mut self, project_id: &str, version: u64) -> Result<()> {
        let project = self
            .projects
            .iter_mut()
            .find(|project| project.id == project_id)
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
        if version > project.version {
            project.version = version;
        }
        Ok(())
    }

    /// Resolve a task reference: full id, short id or display id.
    pub fn resolve_task_id(&self, reference: &str) -> Result<String> {
        let project = self.active_project()?;
        let reference = reference.trim();
        if let Some(task) = project.task(reference) {
            return Ok(task.id.clone());
        }
        if let Some(task) = project.tasks.iter().find(|task| task.short_id == reference) {
            return Ok(task.id.clone());
        }
        let matches: Vec<&Task> = project
            .active_tasks()
            .filter(|task| task.display_id == reference)
            .collect();
        match matches.as_slice() {
            [task] => Ok(task.id.clone()),
            [] => Err(Error::NotFound(format!("task {reference}"))),
            _ => Err(Error::Validation(format!(
                "display id {reference} matches {} tasks; use the short id",
                matches.len()
            ))),
        }
    }

    // =========================================================================
    // Views and subscriptions
    // =========================================================================

    /// Memoized stage grouping of the active project.
    pub fn tasks_by_stage(&self) -> Rc<StageView> {
        if let Some(view) = self.stage_view.borrow().as_ref() {
            return Rc::clone(view);
        }
        let view = Rc::new(build_stage_view(self.active_project().ok()));
        *self.stage_view.borrow_mut() = Some(Rc::clone(&view));
        view
    }

    pub fn subscribe(&self, listener: impl Fn(&StoreEvent) + 'static) -> Subscription {
        let listener: Listener = Rc::new(listener);
        self.listeners.borrow_mut().push(Rc::downgrade(&listener));
        Subscription { _listener: listener }
    }

    fn notify(&self, event: &StoreEvent) {
        let live: Vec<Listener> = {
            let mut listeners = self.listeners.borrow_mut();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener(event);
        }
    }

    fn invalidate_view(&self) {
        self.stage_view.borrow_mut().take();
    }

    // =========================================================================
    // Flags and timers
    // =========================================================================

    pub fn is_editing(&self) -> bool {
        self.editing
    }

    pub fn has_pending_local_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn is_dirty(&self, project_id: &str) -> bool {
        self.dirty.contains(project_id)
    }

    pub fn mark_dirty(&mut self, project_id: &str) {
        let now = self.clock.now();
        self.touch(project_id, now);
    }

    /// Ids of projects changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub fn is_stage_locked(&self, stage: Option<u32>) -> bool {
        self.coordinator.is_locked(stage)
    }

    pub fn schedule(&mut self, key: TimerKey, at: DateTime<Utc>) {
        self.scheduler.schedule(key, at);
    }

    pub fn cancel_timer(&mut self, key: TimerKey) -> bool {
        self.scheduler.cancel(key)
    }

    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.scheduler.is_scheduled(key)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_deadline()
    }

    /// Fire every timer due at `now`. Stage rebalances and the editing
    /// timeout are handled here; every fired key is returned so the caller
    /// can act on `Persist` and `QueueRetry`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TimerKey> {
        let fired = self.scheduler.take_due(now);
        for key in &fired {
            match key {
                TimerKey::StageRebalance => self.perform_stage_rebalance(now),
                TimerKey::EditingTimeout => {
                    self.editing = false;
                    self.notify(&StoreEvent::EditingEnded);
                }
                TimerKey::Persist | TimerKey::QueueRetry => {}
            }
        }
        fired
    }

    /// Cancel every timer and drop pending stage work.
    pub fn teardown(&mut self) {
        self.scheduler.cancel_all();
        self.coordinator.reset();
        self.editing = false;
        tracing::debug!("document store torn down");
    }

    /// Run deferred stage work immediately and end any editing burst.
    /// For callers that exit before their timers would fire.
    pub fn settle(&mut self) {
        let now = self.clock.now();
        self.perform_stage_rebalance(now);
        if self.scheduler.cancel(TimerKey::EditingTimeout) {
            self.editing = false;
            self.notify(&StoreEvent::EditingEnded);
        }
    }

    fn perform_stage_rebalance(&mut self, now: DateTime<Utc>) {
        if !self.coordinator.has_pending() {
            return;
        }
        self.scheduler.cancel(TimerKey::StageRebalance);
        let Some(mut draft) = self.active_project().ok().cloned() else {
            self.coordinator.reset();
            return;
        };
        let stages = self.coordinator.perform(&mut draft, &self.config.layout);
        if let Err(err) = rebalance_in_place(&mut draft, &self.config.layout) {
            tracing::warn!(project = %draft.id, error = %err, "stage rebalance discarded");
            return;
        }
        let project_id = draft.id.clone();
        self.insert_or_replace(draft);
        self.touch(&project_id, now);
        self.notify(&StoreEvent::StagesRebalanced { project_id, stages });
    }

    // =========================================================================
    // History
    // =========================================================================

    pub fn history(&self, project_id: &str) -> Option<&History> {
        self.histories.get(project_id)
    }

    pub fn history_state(&self, project_id: &str) -> HistoryState {
        self.histories
            .get(project_id)
            .map(History::state)
            .unwrap_or_default()
    }

    pub fn restore_history(&mut self, project_id: &str, state: HistoryState) {
        self.histories.insert(
            project_id.to_string(),
            History::from_state(state, self.config.history.clone()),
        );
    }

    /// Undo the newest mutation of the active project. Returns its label.
    pub fn undo(&mut self) -> Result<String> {
        self.step_history(true)
    }

    /// Redo the newest undone mutation of the active project.
    pub fn redo(&mut self) -> Result<String> {
        self.step_history(false)
    }

    fn step_history(&mut self, backwards: bool) -> Result<String> {
        let now = self.clock.now();
        let live = self.active_project()?;
        let (project_id, version) = (live.id.clone(), live.version);
        let history = self.histories.get(&project_id);
        let peeked = if backwards {
            history.and_then(History::peek_undo)
        } else {
            history.and_then(History::peek_redo)
        };
        let entry = peeked.ok_or_else(|| {
            Error::NotFound(if backwards { "nothing to undo" } else { "nothing to redo" }.to_string())
        })?;

        let mut draft = live.clone();
        draft.restore(if backwards { &entry.before } else { &entry.after });
        rebalance_in_place(&mut draft, &self.config.layout)?;
        draft.updated_at = now;

        let history = self.history_mut(&project_id);
        let entry = if backwards {
            history.undo(version)?
        } else {
            history.redo(version)?
        };
        self.insert_or_replace(draft);
        self.touch(&project_id, now);
        let label = format!("{} {}", if backwards { "undo" } else { "redo" }, entry.label);
        self.notify(&StoreEvent::ProjectChanged {
            project_id,
            label: label.clone(),
        });
        Ok(label)
    }

    fn history_mut(&mut self, project_id: &str) -> &mut History {
        let config = self.config.history.clone();
        self.histories
            .entry(project_id.to_string())
            .or_insert_with(|| History::new(config))
    }

    // =========================================================================
    // Task mutations
    // =========================================================================

    /// Add a task to the active project and return its id.
    ///
    /// With a `parent_id` the task becomes that task's child (in `stage`, or
    /// the stage after the parent when none is given). With `as_sibling` it
    /// is placed right after `parent_id` instead, sharing its parent and stage.
    pub fn add_task(
        &mut self,
        title: &str,
        content: &str,
        stage: Option<u32>,
        parent_id: Option<&str>,
        as_sibling: bool,
    ) -> Result<String> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("task title cannot be empty".to_string()));
        }
        let placement = plan_new_task(self.active_project()?, stage, parent_id, as_sibling)?;
        self.coordinator.check(placement.stage)?;

        let title = title.to_string();
        let content = content.to_string();
        self.commit("add task", MutationKind::Structural, None, move |draft, ctx| {
            let mut task = Task::new(title, placement.stage, ctx.now);
            task.content = content;
            task.parent_id = placement.parent_id.clone();

            let parent_rank = placement
                .parent_id
                .as_deref()
                .and_then(|id| draft.task(id))
                .map(Task::rank_value);
            let siblings = draft.stage_tasks(placement.stage);
            let insert = compute_insert_rank(
                placement.stage,
                &siblings,
                placement.before_id.as_deref(),
                parent_rank,
                &ctx.layout,
            );
            let count = siblings.len();
            let rank = apply_refusal_strategy(&task.id, insert.rank, parent_rank, None, &ctx.layout)
                .into_result(&task.id)?;
            if insert.needs_rebalance {
                ctx.crowded.push(placement.stage);
            }
            task.rank = Some(rank);
            task.order = u32::try_from(count + 1).unwrap_or(u32::MAX);

            let id = task.id.clone();
            tracing::debug!(task = %id, stage = %stage_label(placement.stage), rank, "task added");
            draft.tasks.push(task);
            Ok(id)
        })
    }

    /// Move a task to `stage`, optionally before a task of that stage and
    /// under a new parent. Without `parent_id` the current parent is kept
    /// while it still sits in an earlier stage.
    pub fn move_task_to_stage(
        &mut self,
        task_id: &str,
        stage: Option<u32>,
        before_id: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<()> {
        let project = self.active_project()?;
        if let Some(parent_id) = parent_id {
            if would_create_cycle(project, task_id, parent_id) {
                return Err(Error::CycleDetected {
                    task_id: task_id.to_string(),
                });
            }
        }
        project
            .active_task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        if let Some(parent_id) = parent_id {
            let parent = project
                .active_task(parent_id)
                .ok_or_else(|| Error::NotFound(format!("task {parent_id}")))?;
            check_child_stage(parent, stage)?;
        }
        if before_id == Some(task_id) {
            return Err(Error::Validation("a task cannot be placed before itself".to_string()));
        }
        self.coordinator.check(stage)?;

        let id = task_id.to_string();
        let before_id = before_id.map(str::to_string);
        let parent_id = parent_id.map(str::to_string);
        self.commit("move task", MutationKind::Structural, Some(task_id), move |draft, ctx| {
            move_in_draft(draft, ctx, &id, stage, before_id.as_deref(), parent_id)
        })
    }

    /// Make a child task a root of its stage.
    pub fn detach_task(&mut self, task_id: &str) -> Result<()> {
        let task = self
            .active_project()?
            .active_task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        if task.parent_id.is_none() {
            return Err(Error::Validation(format!("task {task_id} has no parent")));
        }
        self.coordinator.check(task.stage)?;

        let id = task_id.to_string();
        self.commit("detach task", MutationKind::Structural, Some(task_id), move |draft, ctx| {
            let task = draft
                .task_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            task.parent_id = None;
            task.updated_at = ctx.now;
            Ok(())
        })
    }

    /// Re-rank a stage to follow `ordered_ids`.
    pub fn reorder_stage(&mut self, stage: Option<u32>, ordered_ids: &[String]) -> Result<()> {
        self.active_project()?;
        self.coordinator.check(stage)?;
        let ids = ordered_ids.to_vec();
        self.commit("reorder stage", MutationKind::Structural, None, move |draft, ctx| {
            let count = reorder_stage_ranks(draft, stage, &ids, &ctx.layout)?;
            for id in &ids {
                if let Some(task) = draft.task_mut(id) {
                    task.updated_at = ctx.now;
                }
            }
            tracing::debug!(stage = %stage_label(stage), count, "stage reordered");
            Ok(())
        })
    }

    /// Replace a task's content. Consecutive edits of one task coalesce into
    /// a single undo step and keep the editing flag raised.
    pub fn update_task_content(&mut self, task_id: &str, content: &str) -> Result<()> {
        self.active_project()?
            .active_task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        let id = task_id.to_string();
        let content = content.to_string();
        self.commit("edit content", MutationKind::Content, Some(task_id), move |draft, ctx| {
            let task = draft
                .task_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            task.content = content;
            task.updated_at = ctx.now;
            Ok(())
        })?;

        let now = self.clock.now();
        self.editing = true;
        self.scheduler
            .schedule_in(TimerKey::EditingTimeout, now, self.config.sync.editing_timeout_ms);
        Ok(())
    }

    pub fn update_task_fields(&mut self, task_id: &str, fields: TaskFields) -> Result<()> {
        if fields.is_empty() {
            return Err(Error::Validation("no fields to update".to_string()));
        }
        if fields.title.as_deref().map(|title| title.trim().is_empty()).unwrap_or(false) {
            return Err(Error::Validation("task title cannot be empty".to_string()));
        }
        self.active_project()?
            .active_task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        let id = task_id.to_string();
        self.commit("update task", MutationKind::Structural, Some(task_id), move |draft, ctx| {
            let task = draft
                .task_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
            if let Some(title) = fields.title {
                task.title = title.trim().to_string();
            }
            if let Some(status) = fields.status {
                task.status = status;
            }
            if let Some(priority) = fields.priority {
                task.priority = priority;
            }
            if let Some(due_date) = fields.due_date {
                task.due_date = due_date;
            }
            if let Some(tags) = fields.tags {
                task.tags = tags;
            }
            task.updated_at = ctx.now;
            Ok(())
        })
    }

    /// Soft-delete a task and its subtree. Returns the number of tasks deleted.
    pub fn delete_task(&mut self, task_id: &str) -> Result<usize> {
        self.active_project()?
            .active_task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        let id = task_id.to_string();
        self.commit("delete task", MutationKind::Structural, Some(task_id), move |draft, ctx| {
            let mut ids = vec![id.clone()];
            ids.extend(draft.descendant_ids(&id));
            let mut count = 0;
            for id in ids {
                if let Some(task) = draft.task_mut(&id).filter(|task| !task.is_deleted()) {
                    task.deleted_at = Some(ctx.now);
                    task.updated_at = ctx.now;
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Bring back a soft-deleted task together with the descendants that
    /// were deleted with it.
    pub fn restore_task(&mut self, task_id: &str) -> Result<usize> {
        let task = self
            .active_project()?
            .task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        let Some(deleted_at) = task.deleted_at else {
            return Err(Error::Validation(format!("task {task_id} is not deleted")));
        };
        self.coordinator.check(task.stage)?;

        let id = task_id.to_string();
        self.commit("restore task", MutationKind::Structural, Some(task_id), move |draft, ctx| {
            let mut ids = vec![id.clone()];
            ids.extend(draft.descendant_ids(&id));
            let mut count = 0;
            for id in ids {
                if let Some(task) = draft
                    .task_mut(&id)
                    .filter(|task| task.deleted_at == Some(deleted_at))
                {
                    task.deleted_at = None;
                    task.updated_at = ctx.now;
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Remove a task, its subtree and every connection touching them.
    pub fn permanently_delete_task(&mut self, task_id: &str) -> Result<usize> {
        self.active_project()?
            .task(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        let id = task_id.to_string();
        self.commit("purge task", MutationKind::Structural, Some(task_id), move |draft, _ctx| {
            let mut doomed: BTreeSet<String> = draft.descendant_ids(&id).into_iter().collect();
            doomed.insert(id);
            let before = draft.tasks.len();
            draft.tasks.retain(|task| !doomed.contains(&task.id));
            draft
                .connections
                .retain(|connection| !doomed.contains(&connection.source) && !doomed.contains(&connection.target));
            Ok(before - draft.tasks.len())
        })
    }

    // =========================================================================
    // Connections
    // =========================================================================

    pub fn add_connection(&mut self, source: &str, target: &str, description: Option<String>) -> Result<String> {
        let project = self.active_project()?;
        for endpoint in [source, target] {
            project
                .active_task(endpoint)
                .ok_or_else(|| Error::NotFound(format!("task {endpoint}")))?;
        }
        if source == target {
            return Err(Error::Validation("a task cannot connect to itself".to_string()));
        }
        let duplicate = project.connections.iter().any(|connection| {
            connection.deleted_at.is_none() && connection.source == source && connection.target == target
        });
        if duplicate {
            return Err(Error::Validation(format!("{source} is already connected to {target}")));
        }

        let (source, target) = (source.to_string(), target.to_string());
        self.commit("add connection", MutationKind::Structural, None, move |draft, ctx| {
            let connection = Connection::new(source, target, description, ctx.now);
            let id = connection.id.clone();
            draft.connections.push(connection);
            Ok(id)
        })
    }

    pub fn remove_connection(&mut self, connection_id: &str) -> Result<()> {
        let exists = self
            .active_project()?
            .connections
            .iter()
            .any(|connection| connection.id == connection_id && connection.deleted_at.is_none());
        if !exists {
            return Err(Error::NotFound(format!("connection {connection_id}")));
        }

        let id = connection_id.to_string();
        self.commit("remove connection", MutationKind::Structural, None, move |draft, ctx| {
            if let Some(connection) = draft.connections.iter_mut().find(|connection| connection.id == id) {
                connection.deleted_at = Some(ctx.now);
                connection.updated_at = ctx.now;
            }
            Ok(())
        })
    }

    // =========================================================================
    // Commit path
    // =========================================================================

    fn commit<R>(
        &mut self,
        label: &str,
        kind: MutationKind,
        task_id: Option<&str>,
        edit: impl FnOnce(&mut Project, &mut EditContext) -> Result<R>,
    ) -> Result<R> {
        let now = self.clock.now();
        let live = self.active_project()?;
        let before = live.snapshot();
        let version = live.version;
        let mut draft = live.clone();

        let mut ctx = EditContext {
            layout: self.config.layout.clone(),
            now,
            crowded: Vec::new(),
        };
        let value = edit(&mut draft, &mut ctx)?;
        rebalance_in_place(&mut draft, &ctx.layout)?;
        draft.updated_at = now;

        let mut entry = HistoryEntry::new(label, kind, before, draft.snapshot(), version, now);
        if let Some(task_id) = task_id {
            entry = entry.with_task(task_id);
        }
        let project_id = draft.id.clone();
        self.history_mut(&project_id).record(entry);
        self.insert_or_replace(draft);

        for stage in ctx.crowded {
            self.coordinator
                .request(stage, now, &mut self.scheduler, &self.config.layout);
        }
        self.touch(&project_id, now);
        self.notify(&StoreEvent::ProjectChanged {
            project_id,
            label: label.to_string(),
        });
        Ok(value)
    }

    fn insert_or_replace(&mut self, project: Project) {
        match self.projects.iter_mut().find(|existing| existing.id == project.id) {
            Some(existing) => *existing = project,
            None => self.projects.push(project),
        }
    }

    fn touch(&mut self, project_id: &str, now: DateTime<Utc>) {
        self.dirty.insert(project_id.to_string());
        self.scheduler
            .schedule_in(TimerKey::Persist, now, self.config.sync.persist_debounce_ms);
        self.invalidate_view();
    }
}

/// Sanitize then rebalance a document arriving from outside the store.
pub fn prepare_incoming(mut project: Project, layout: &LayoutConfig) -> Result<(Project, SanitizeReport)> {
    let report = sanitize(&mut project)?;
    if !report.is_clean() {
        tracing::warn!(project = %project.id, repairs = report.repairs.len(), "project repaired");
    }
    rebalance_in_place(&mut project, layout)?;
    Ok((project, report))
}

fn build_stage_view(project: Option<&Project>) -> StageView {
    let mut view = StageView::new();
    for task in project.into_iter().flat_map(|project| project.active_tasks()) {
        view.entry(task.stage).or_default().push(task.clone());
    }
    for tasks in view.values_mut() {
        tasks.sort_by(compare_by_rank);
    }
    view
}

fn check_child_stage(parent: &Task, stage: Option<u32>) -> Result<u32> {
    let parent_stage = parent.stage.ok_or_else(|| {
        Error::ParentChildConflict(format!("task {} has no stage and cannot have children", parent.id))
    })?;
    match stage {
        Some(stage) if stage > parent_stage => Ok(stage),
        _ => Err(Error::ParentChildConflict(format!(
            "stage {} must come after parent stage {parent_stage}",
            stage_label(stage)
        ))),
    }
}

fn plan_new_task(
    project: &Project,
    stage: Option<u32>,
    reference: Option<&str>,
    as_sibling: bool,
) -> Result<Placement> {
    let Some(reference) = reference else {
        return Ok(Placement {
            stage,
            parent_id: None,
            before_id: None,
        });
    };
    let reference = project
        .active_task(reference)
        .ok_or_else(|| Error::NotFound(format!("task {reference}")))?;

    if as_sibling {
        let mut peers = project.stage_tasks(reference.stage);
        peers.sort_by(|a, b| compare_by_rank(a, b));
        let before_id = peers
            .iter()
            .skip_while(|task| task.id != reference.id)
            .nth(1)
            .map(|task| task.id.clone());
        return Ok(Placement {
            stage: reference.stage,
            parent_id: reference.parent_id.clone(),
            before_id,
        });
    }

    let stage = match stage {
        Some(stage) => Some(stage),
        None => reference.stage.map(|parent_stage| parent_stage + 1),
    };
    let stage = check_child_stage(reference, stage)?;
    Ok(Placement {
        stage: Some(stage),
        parent_id: Some(reference.id.clone()),
        before_id: None,
    })
}

fn move_in_draft(
    draft: &mut Project,
    ctx: &mut EditContext,
    task_id: &str,
    stage: Option<u32>,
    before_id: Option<&str>,
    parent_id: Option<String>,
) -> Result<()> {
    let task = draft
        .active_task(task_id)
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
    let old_stage = task.stage;
    let parent_id = match parent_id {
        Some(id) => Some(id),
        None => task.parent_id.clone().filter(|id| {
            let parent_stage = draft.active_task(id).and_then(|parent| parent.stage);
            matches!((parent_stage, stage), (Some(parent), Some(stage)) if stage > parent)
        }),
    };
    let parent_rank = parent_id
        .as_deref()
        .and_then(|id| draft.task(id))
        .map(Task::rank_value);

    // Landing at or past a child's stage drags the whole subtree along.
    let subtree = draft.descendant_ids(task_id);
    let first_child_stage = draft
        .children_of(task_id)
        .iter()
        .filter_map(|child| child.stage)
        .min();
    let shift = match (old_stage, stage, first_child_stage) {
        (Some(old), Some(new), Some(child)) if new >= child => new.checked_sub(old),
        _ => None,
    };
    let child_bound = match (shift, stage) {
        (None, Some(_)) => min_child_rank(draft, task_id),
        _ => None,
    };

    let siblings: Vec<&Task> = draft
        .stage_tasks(stage)
        .into_iter()
        .filter(|task| task.id != task_id)
        .filter(|task| shift.is_none() || !subtree.contains(&task.id))
        .collect();
    let insert = compute_insert_rank(stage, &siblings, before_id, parent_rank, &ctx.layout);
    let rank = apply_refusal_strategy(task_id, insert.rank, parent_rank, child_bound, &ctx.layout)
        .into_result(task_id)?;
    if insert.needs_rebalance {
        ctx.crowded.push(stage);
    }

    if let Some(delta) = shift {
        for id in &subtree {
            if let Some(child) = draft.task_mut(id) {
                child.stage = child.stage.map(|stage| stage + delta);
                child.x = None;
                child.y = None;
                child.updated_at = ctx.now;
            }
        }
    }

    let task = draft
        .task_mut(task_id)
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
    if task.stage != stage {
        task.x = None;
        task.y = None;
    }
    task.stage = stage;
    task.parent_id = parent_id;
    task.rank = Some(rank);
    task.updated_at = ctx.now;
    tracing::debug!(task = task_id, stage = %stage_label(stage), rank, shifted = shift.is_some(), "task moved");
    Ok(())
}
