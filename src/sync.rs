//! Offline-first sync between the document store and a remote.
//!
//! Local edits are persisted to the cache and pushed through the
//! [`ActionQueue`] as `update:project` actions. The local `version` of a
//! project is the last version the remote acknowledged; a push carries
//! `version + 1` and the remote accepts it only if that is newer than what
//! it holds. A rejected push comes back with the remote document and turns
//! into a [`PendingConflict`]; conflicts without diverging entities are
//! merged automatically.
//!
//! Realtime events from the remote are applied with the queue paused. While
//! the user is typing, or shortly after a local write, they are parked and
//! replayed on a later tick.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::conflict::{PendingConflict, Resolution};
use crate::error::{Error, Result, SyncError};
use crate::model::{CacheSnapshot, Project};
use crate::queue::{ActionPriority, ActionQueue, ActionType, Enqueued, ProcessReport, Processor, QueuedAction};
use crate::remote::{RealtimeEvent, RealtimeEventType, RemoteStore};
use crate::storage::{ConflictRecord, Session, Storage};
use crate::store::{DocumentStore, LoadReport};
use crate::timer::{millis, Clock, TimerKey};

/// Entity type used for whole-project actions.
pub const PROJECT_ENTITY: &str = "project";

/// Passes over the queue per processing round; a conflict merge may enqueue
/// a follow-up push that should go out in the same round.
const MAX_PROCESS_PASSES: usize = 3;

/// What the queue processors observed, drained after each pass.
#[derive(Debug, Clone)]
enum PushOutcome {
    Acked { project_id: String, version: u64 },
    Rejected { sent: Project, remote: Project },
}

/// How a realtime event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Ignored,
    Deferred,
    Merged,
    Conflict,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub enqueued: usize,
    pub queue: ProcessReport,
    pub acked: usize,
    pub merged: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconnectReport {
    pub pulled: usize,
    pub adopted: usize,
    pub merged: usize,
    pub conflicts: usize,
    pub sync: SyncReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub fired: Vec<&'static str>,
    pub sync: Option<SyncReport>,
    pub events: Vec<EventOutcome>,
}

pub struct SyncEngine {
    store: DocumentStore,
    queue: ActionQueue,
    remote: Rc<dyn RemoteStore>,
    storage: Storage,
    outcomes: Rc<RefCell<Vec<PushOutcome>>>,
    online: bool,
    pending_conflict: Option<PendingConflict>,
    deferred_events: Vec<RealtimeEvent>,
    last_local_write_at: Option<DateTime<Utc>>,
}

impl SyncEngine {
    /// Wire a store to a remote. The queue is restored from `storage`.
    pub fn new(store: DocumentStore, remote: Rc<dyn RemoteStore>, storage: Storage) -> Result<Self> {
        let queue_config = store.config().queue.clone();
        let queue = ActionQueue::from_state(storage.load_queue()?, queue_config);
        let mut engine = Self {
            store,
            queue,
            remote,
            storage,
            outcomes: Rc::new(RefCell::new(Vec::new())),
            online: true,
            pending_conflict: None,
            deferred_events: Vec::new(),
            last_local_write_at: None,
        };
        engine.register_processors();
        Ok(engine)
    }

    /// Load the cache, session and histories under `storage` into a fresh
    /// store and wire it to `remote`.
    pub fn open(
        storage: Storage,
        config: Config,
        clock: Rc<dyn Clock>,
        remote: Rc<dyn RemoteStore>,
    ) -> Result<(Self, LoadReport)> {
        let mut store = DocumentStore::new(config, clock);
        let cache = storage.load_cache()?;
        let report = store.load_projects(cache.projects);
        for project_id in store.projects().iter().map(|project| project.id.clone()).collect::<Vec<_>>() {
            store.restore_history(&project_id, storage.load_history(&project_id)?);
        }
        if let Some(active) = storage.load_session()?.active_project {
            if store.project(&active).is_some() {
                store.select_project(&active)?;
            }
        }
        let conflict = storage.load_conflict()?;
        let mut engine = Self::new(store, remote, storage)?;
        if let Some(record) = conflict {
            let layout = engine.store.config().layout.clone();
            engine.pending_conflict = Some(PendingConflict::detect(
                &record.local,
                &record.remote,
                &layout,
                record.detected_at,
            )?);
        }
        Ok((engine, report))
    }

    fn register_processors(&mut self) {
        let owner = self.store.config().owner.id.clone();
        for action_type in [ActionType::Create, ActionType::Update] {
            let processor = save_processor(Rc::clone(&self.remote), owner.clone(), Rc::clone(&self.outcomes));
            self.queue.register_processor(action_type, PROJECT_ENTITY, processor);
        }
        self.queue.register_processor(
            ActionType::Delete,
            PROJECT_ENTITY,
            delete_processor(Rc::clone(&self.remote), owner),
        );
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut DocumentStore {
        &mut self.store
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn set_online(&mut self, online: bool) {
        if self.online != online {
            tracing::info!(online, "connectivity changed");
        }
        self.online = online;
    }

    pub fn pending_conflict(&self) -> Option<&PendingConflict> {
        self.pending_conflict.as_ref()
    }

    pub fn deferred_events(&self) -> usize {
        self.deferred_events.len()
    }

    // =========================================================================
    // Local persistence
    // =========================================================================

    /// Write every project, the session, histories and the queue to disk.
    pub fn persist_local(&mut self) -> Result<()> {
        let cache = CacheSnapshot {
            projects: self.store.projects().to_vec(),
        };
        self.storage.save_cache(&cache)?;
        self.storage.save_session(&Session {
            active_project: self.store.active_project_id().map(str::to_string),
        })?;
        for project in self.store.projects() {
            self.storage
                .save_history(&project.id, &self.store.history_state(&project.id))?;
        }
        self.storage.save_queue(&self.queue.state())?;
        let conflict = self.pending_conflict.as_ref().map(|pending| ConflictRecord {
            local: pending.local.clone(),
            remote: pending.remote.clone(),
            detected_at: pending.detected_at,
        });
        self.storage.save_conflict(conflict.as_ref())?;
        tracing::debug!(projects = cache.projects.len(), "local cache written");
        Ok(())
    }

    /// Stamp a write that originated on this device. Remote applies and
    /// acks persist too but never open the quiet window.
    fn note_local_write(&mut self) {
        self.last_local_write_at = Some(self.store.now());
    }

    fn recently_persisted(&self, now: DateTime<Utc>) -> bool {
        let window = millis(self.store.config().sync.recently_persisted_ms);
        self.last_local_write_at
            .map(|at| now - at < window)
            .unwrap_or(false)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Persist locally, enqueue a push for every changed project and, when
    /// online, process the queue.
    pub async fn flush(&mut self) -> Result<SyncReport> {
        let now = self.store.now();
        self.store.cancel_timer(TimerKey::Persist);

        let mut report = SyncReport::default();
        for project_id in self.store.take_dirty() {
            let Some(project) = self.store.project(&project_id) else {
                continue;
            };
            let mut payload = project.clone();
            payload.version += 1;
            self.enqueue_push(payload, ActionPriority::Normal, now)?;
            report.enqueued += 1;
        }
        if report.enqueued > 0 {
            self.note_local_write();
        }
        self.persist_local()?;

        if self.online {
            let processed = self.process().await?;
            report.queue = processed.queue;
            report.acked += processed.acked;
            report.merged += processed.merged;
            report.conflicts += processed.conflicts;
        }
        Ok(report)
    }

    /// Run the queue and fold push results back into the store.
    pub async fn process(&mut self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if !self.online {
            report.queue.remaining = self.queue.len();
            return Ok(report);
        }

        for _ in 0..MAX_PROCESS_PASSES {
            let now = self.store.now();
            let pass = self.queue.process_queue(now).await;
            accumulate(&mut report.queue, &pass);
            report.queue.remaining = pass.remaining;
            report.queue.paused = pass.paused;

            let outcomes: Vec<PushOutcome> = self.outcomes.borrow_mut().drain(..).collect();
            let mut follow_up = false;
            for outcome in outcomes {
                match outcome {
                    PushOutcome::Acked { project_id, version } => {
                        if self.store.project(&project_id).is_some() {
                            self.store.acknowledge(&project_id, version)?;
                        }
                        report.acked += 1;
                    }
                    PushOutcome::Rejected { sent, remote } => match self.absorb_remote(sent, remote, now)? {
                        EventOutcome::Merged => {
                            report.merged += 1;
                            follow_up = true;
                        }
                        EventOutcome::Conflict => report.conflicts += 1,
                        _ => {}
                    },
                }
            }
            if !follow_up || pass.paused {
                break;
            }
        }

        if let Some(at) = self.queue.next_attempt_at() {
            self.store.schedule(TimerKey::QueueRetry, at);
        }
        self.storage.save_queue(&self.queue.state())?;
        if report.acked > 0 || report.merged > 0 || report.conflicts > 0 {
            self.persist_local()?;
        }
        Ok(report)
    }

    fn enqueue_push(&mut self, payload: Project, priority: ActionPriority, now: DateTime<Utc>) -> Result<Enqueued> {
        let entity_id = payload.id.clone();
        let action = QueuedAction::new(
            ActionType::Update,
            PROJECT_ENTITY,
            entity_id,
            serde_json::to_value(&payload)?,
            now,
        )
        .with_priority(priority);
        Ok(self.queue.enqueue(action, now))
    }

    /// Remove a project locally and queue its remote deletion.
    pub async fn delete_project(&mut self, project_id: &str) -> Result<SyncReport> {
        let now = self.store.now();
        self.store.remove_project(project_id)?;
        self.storage.remove_history(project_id)?;
        let action = QueuedAction::new(
            ActionType::Delete,
            PROJECT_ENTITY,
            project_id,
            serde_json::json!({ "id": project_id }),
            now,
        );
        self.queue.enqueue(action, now);
        self.note_local_write();
        self.persist_local()?;
        self.process().await
    }

    pub fn retry_dead_letter(&mut self, id: Uuid) -> Result<()> {
        self.queue.retry_dead_letter(id)?;
        self.storage.save_queue(&self.queue.state())
    }

    pub fn dismiss_dead_letter(&mut self, id: Uuid) -> Result<()> {
        self.queue.dismiss_dead_letter(id)?;
        self.storage.save_queue(&self.queue.state())
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Go online, pull every project of the owner, reconcile and push.
    pub async fn reconnect(&mut self) -> Result<ReconnectReport> {
        self.set_online(true);
        let owner = self.store.config().owner.id.clone();
        let projects = self.remote.load_projects(&owner).await?;
        let now = self.store.now();

        let mut report = ReconnectReport {
            pulled: projects.len(),
            ..ReconnectReport::default()
        };
        for remote in projects {
            match self.reconcile(remote, now)? {
                EventOutcome::Applied => report.adopted += 1,
                EventOutcome::Merged => report.merged += 1,
                EventOutcome::Conflict => report.conflicts += 1,
                EventOutcome::Ignored | EventOutcome::Deferred => {}
            }
        }
        self.persist_local()?;
        report.sync = self.flush().await?;
        tracing::info!(
            pulled = report.pulled,
            adopted = report.adopted,
            merged = report.merged,
            conflicts = report.conflicts,
            "reconnected"
        );
        Ok(report)
    }

    /// Bring one remote document into the store: adopt it when nothing is
    /// pending locally, merge when both sides moved.
    fn reconcile(&mut self, remote: Project, now: DateTime<Utc>) -> Result<EventOutcome> {
        let Some(local) = self.store.project(&remote.id) else {
            self.store.adopt_project(remote)?;
            return Ok(EventOutcome::Applied);
        };
        if remote.version <= local.version {
            return Ok(EventOutcome::Ignored);
        }
        if !self.has_local_changes(&remote.id) {
            self.store.adopt_project(remote)?;
            return Ok(EventOutcome::Applied);
        }
        let local = local.clone();
        self.absorb_remote(local, remote, now)
    }

    fn has_local_changes(&self, project_id: &str) -> bool {
        self.store.is_dirty(project_id)
            || self
                .pending_conflict
                .as_ref()
                .is_some_and(|pending| pending.project_id == project_id)
            || self
                .queue
                .actions()
                .any(|action| action.entity_type == PROJECT_ENTITY && action.entity_id == project_id)
    }

    /// Both sides changed: merge silently when nothing diverges, otherwise
    /// park a conflict for the user.
    fn absorb_remote(&mut self, sent: Project, remote: Project, now: DateTime<Utc>) -> Result<EventOutcome> {
        let local = self.store.project(&remote.id).cloned().unwrap_or(sent);
        let layout = self.store.config().layout.clone();
        let pending = PendingConflict::detect(&local, &remote, &layout, now)?;

        if pending.conflict_count() == 0 {
            let resolved = pending.resolve(Resolution::Merge, &layout)?;
            self.adopt_resolved(resolved.project, resolved.push, now)?;
            return Ok(EventOutcome::Merged);
        }

        tracing::warn!(
            project = %pending.project_id,
            conflicts = pending.conflict_count(),
            local_version = local.version,
            remote_version = remote.version,
            "sync conflict needs a decision"
        );
        self.pending_conflict = Some(pending);
        Ok(EventOutcome::Conflict)
    }

    fn adopt_resolved(&mut self, project: Project, push: bool, now: DateTime<Utc>) -> Result<()> {
        self.store.adopt_project(project.clone())?;
        if push {
            self.enqueue_push(project, ActionPriority::Critical, now)?;
        }
        Ok(())
    }

    /// Apply the user's choice for the pending conflict.
    pub async fn resolve_conflict(&mut self, choice: Resolution) -> Result<SyncReport> {
        let pending = self
            .pending_conflict
            .take()
            .ok_or_else(|| Error::NotFound("no pending conflict".to_string()))?;
        let layout = self.store.config().layout.clone();
        let resolved = match pending.resolve(choice, &layout) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.pending_conflict = Some(pending);
                return Err(err);
            }
        };
        let now = self.store.now();
        if resolved.push {
            self.note_local_write();
        }
        self.adopt_resolved(resolved.project, resolved.push, now)?;
        self.persist_local()?;
        self.process().await
    }

    /// Replace a project with a checkpoint copy. The live version is kept
    /// so the restored document pushes as an ordinary local change.
    pub fn restore_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let mut project = checkpoint.project.clone();
        if let Some(live) = self.store.project(&project.id) {
            project.version = live.version;
        }
        project.updated_at = self.store.now();
        let project_id = project.id.clone();
        self.store.adopt_project(project)?;
        self.store.mark_dirty(&project_id);
        self.note_local_write();
        self.persist_local()
    }

    // =========================================================================
    // Realtime
    // =========================================================================

    /// Apply a realtime event, or park it while the user is editing or a
    /// local write just went out.
    pub async fn apply_realtime_event(&mut self, event: RealtimeEvent) -> Result<EventOutcome> {
        let now = self.store.now();
        if self.store.is_editing() || self.recently_persisted(now) {
            tracing::debug!(
                project = %event.project_id,
                editing = self.store.is_editing(),
                "realtime event deferred"
            );
            // A later event for the same project supersedes a parked one.
            self.deferred_events
                .retain(|parked| parked.project_id != event.project_id);
            self.deferred_events.push(event);
            return Ok(EventOutcome::Deferred);
        }

        let was_paused = self.queue.is_paused();
        if !was_paused {
            self.queue.pause();
        }
        let outcome = self.apply_event_now(event, now).await;
        if !was_paused {
            self.queue.resume();
        }
        let outcome = outcome?;
        if outcome != EventOutcome::Ignored {
            self.persist_local()?;
        }
        Ok(outcome)
    }

    async fn apply_event_now(&mut self, event: RealtimeEvent, now: DateTime<Utc>) -> Result<EventOutcome> {
        match event.event_type {
            RealtimeEventType::Delete if event.task_id.is_none() => {
                if self.store.project(&event.project_id).is_none() {
                    return Ok(EventOutcome::Ignored);
                }
                self.store.remove_project(&event.project_id)?;
                self.storage.remove_history(&event.project_id)?;
                Ok(EventOutcome::Applied)
            }
            _ => {
                let remote = match event.data {
                    Some(project) => Some(project),
                    None => self.remote.load_project(&event.project_id).await?,
                };
                match remote {
                    Some(remote) => self.reconcile(remote, now),
                    None => Ok(EventOutcome::Ignored),
                }
            }
        }
    }

    /// Drain the remote's realtime feed.
    pub async fn pump_realtime(&mut self) -> Result<Vec<EventOutcome>> {
        let mut outcomes = Vec::new();
        for event in self.remote.poll_events() {
            outcomes.push(self.apply_realtime_event(event).await?);
        }
        Ok(outcomes)
    }

    async fn replay_deferred(&mut self) -> Result<Vec<EventOutcome>> {
        let now = self.store.now();
        if self.deferred_events.is_empty() || self.store.is_editing() || self.recently_persisted(now) {
            return Ok(Vec::new());
        }
        let events = std::mem::take(&mut self.deferred_events);
        tracing::debug!(count = events.len(), "replaying deferred realtime events");
        let mut outcomes = Vec::new();
        for event in events {
            outcomes.push(self.apply_realtime_event(event).await?);
        }
        Ok(outcomes)
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Fire due timers, push when the persist debounce elapsed, retry the
    /// queue when its backoff is over, and apply realtime events.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let now = self.store.now();
        let fired = self.store.tick(now);
        let mut report = TickReport {
            fired: fired.iter().map(|key| key.as_str()).collect(),
            ..TickReport::default()
        };

        if fired.contains(&TimerKey::Persist) {
            report.sync = Some(self.flush().await?);
        } else if fired.contains(&TimerKey::QueueRetry) && self.online {
            report.sync = Some(self.process().await?);
        }

        report.events = self.replay_deferred().await?;
        if self.online {
            report.events.extend(self.pump_realtime().await?);
        }
        Ok(report)
    }

    /// Cancel all timers and drop parked events.
    pub fn teardown(&mut self) {
        self.store.teardown();
        self.deferred_events.clear();
    }
}

fn accumulate(total: &mut ProcessReport, pass: &ProcessReport) {
    total.processed += pass.processed;
    total.retried += pass.retried;
    total.dead_lettered += pass.dead_lettered;
    total.dropped += pass.dropped;
    total.deferred += pass.deferred;
}

fn save_processor(remote: Rc<dyn RemoteStore>, owner: String, outcomes: Rc<RefCell<Vec<PushOutcome>>>) -> Processor {
    Box::new(move |action: QueuedAction| {
        let remote = Rc::clone(&remote);
        let owner = owner.clone();
        let outcomes = Rc::clone(&outcomes);
        async move {
            let project: Project = serde_json::from_value(action.payload)
                .map_err(|err| SyncError::business(format!("malformed project payload: {err}")))?;
            let project_id = project.id.clone();
            let version = project.version;
            let saved = remote.save_project(project.clone(), &owner).await?;
            if saved.success {
                outcomes
                    .borrow_mut()
                    .push(PushOutcome::Acked { project_id, version });
                return Ok(());
            }
            match saved.remote_data {
                Some(stored) => {
                    tracing::info!(project = %project_id, sent = version, stored = stored.version, "push rejected as stale");
                    outcomes.borrow_mut().push(PushOutcome::Rejected {
                        sent: project,
                        remote: stored,
                    });
                    Ok(())
                }
                None => Err(SyncError::business(format!(
                    "remote refused project {project_id} without a stored copy"
                ))),
            }
        }
        .boxed_local()
    })
}

fn delete_processor(remote: Rc<dyn RemoteStore>, owner: String) -> Processor {
    Box::new(move |action: QueuedAction| {
        let remote = Rc::clone(&remote);
        let owner = owner.clone();
        async move {
            let removed = remote.delete_project(&action.entity_id, &owner).await?;
            if !removed {
                tracing::debug!(project = %action.entity_id, "remote had nothing to delete");
            }
            Ok(())
        }
        .boxed_local()
    })
}
