//! Offline action queue with retry, backoff and a dead-letter store.
//!
//! Actions are processed FIFO by a processor registered for their
//! `type:entityType` key. Failures are classified by [`SyncErrorKind`]:
//! network, timeout and unknown errors retry with exponential backoff until
//! the retry budget is spent; business errors never retry. Terminal failures
//! are dead-lettered once (priority normal and critical) or dropped (low).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result, SyncError, SyncErrorKind};
use crate::timer::millis;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    Low,
    #[default]
    Normal,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedAction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<SyncErrorKind>,
    #[serde(default)]
    pub priority: ActionPriority,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedAction {
    pub fn new(
        action_type: ActionType,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            retry_count: 0,
            last_error: None,
            error_type: None,
            priority: ActionPriority::Normal,
            enqueued_at: now,
            next_attempt_at: None,
        }
    }

    pub fn with_priority(mut self, priority: ActionPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Processor lookup key, e.g. `update:project`.
    pub fn processor_key(&self) -> String {
        processor_key(self.action_type, &self.entity_type)
    }

    fn entity_key(&self) -> (String, String) {
        (self.entity_type.clone(), self.entity_id.clone())
    }

    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map(|at| at <= now).unwrap_or(true)
    }
}

pub fn processor_key(action_type: ActionType, entity_type: &str) -> String {
    format!("{}:{entity_type}", action_type.as_str())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterItem {
    pub action: QueuedAction,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

/// Durable queue contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    #[serde(default)]
    pub actions: Vec<QueuedAction>,
    #[serde(default)]
    pub dead_letters: Vec<DeadLetterItem>,
}

pub type ProcessorResult = std::result::Result<(), SyncError>;

/// Delivers one action. Processors run on the caller's thread.
pub type Processor = Box<dyn Fn(QueuedAction) -> LocalBoxFuture<'static, ProcessorResult>>;

/// Exponential backoff: `base_ms * 2^attempt`, capped at `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(multiplier).min(self.max_ms)
    }
}

/// What happened to an enqueued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued(Uuid),
    /// Folded into a pending update for the same entity.
    Coalesced(Uuid),
    /// The queue is full of critical actions; the incoming action went
    /// straight to the dead-letter store (normal) or was dropped (low).
    Rejected(Uuid),
}

/// Outcome of one [`ActionQueue::process_queue`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
    pub deferred: usize,
    pub remaining: usize,
    pub paused: bool,
}

pub struct ActionQueue {
    actions: VecDeque<QueuedAction>,
    dead_letters: VecDeque<DeadLetterItem>,
    processors: HashMap<String, Processor>,
    config: QueueConfig,
    paused: bool,
}

impl fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionQueue")
            .field("actions", &self.actions.len())
            .field("dead_letters", &self.dead_letters.len())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .field("paused", &self.paused)
            .finish()
    }
}

impl ActionQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            actions: VecDeque::new(),
            dead_letters: VecDeque::new(),
            processors: HashMap::new(),
            config,
            paused: false,
        }
    }

    pub fn from_state(state: QueueState, config: QueueConfig) -> Self {
        let mut queue = Self::new(config);
        queue.actions = state.actions.into_iter().collect();
        queue.dead_letters = state.dead_letters.into_iter().collect();
        queue
    }

    pub fn state(&self) -> QueueState {
        QueueState {
            actions: self.actions.iter().cloned().collect(),
            dead_letters: self.dead_letters.iter().cloned().collect(),
        }
    }

    pub fn register_processor(&mut self, action_type: ActionType, entity_type: &str, processor: Processor) {
        self.processors
            .insert(processor_key(action_type, entity_type), processor);
    }

    pub fn enqueue(&mut self, action: QueuedAction, now: DateTime<Utc>) -> Enqueued {
        if action.action_type == ActionType::Update {
            let pending = self.actions.iter_mut().find(|queued| {
                queued.action_type == ActionType::Update
                    && queued.retry_count == 0
                    && queued.entity_type == action.entity_type
                    && queued.entity_id == action.entity_id
            });
            if let Some(pending) = pending {
                pending.payload = action.payload;
                pending.priority = pending.priority.max(action.priority);
                return Enqueued::Coalesced(pending.id);
            }
        }

        let id = action.id;
        if self.actions.len() >= self.config.capacity && !self.make_room(&action, now) {
            if action.priority == ActionPriority::Low {
                tracing::debug!(action = %id, "queue full, dropping low-priority action");
            } else {
                self.dead_letter(action, "capacity".to_string(), now);
            }
            return Enqueued::Rejected(id);
        }

        tracing::debug!(action = %id, key = %action.processor_key(), "enqueued");
        self.actions.push_back(action);
        Enqueued::Queued(id)
    }

    /// Evict one action to fit `incoming`. Critical actions are never evicted.
    fn make_room(&mut self, incoming: &QueuedAction, now: DateTime<Utc>) -> bool {
        if let Some(index) = self
            .actions
            .iter()
            .position(|queued| queued.priority == ActionPriority::Low)
        {
            if let Some(evicted) = self.actions.remove(index) {
                tracing::debug!(action = %evicted.id, "queue full, dropped oldest low-priority action");
            }
            return true;
        }
        if incoming.priority == ActionPriority::Low {
            return false;
        }
        if let Some(index) = self
            .actions
            .iter()
            .position(|queued| queued.priority == ActionPriority::Normal)
        {
            if let Some(evicted) = self.actions.remove(index) {
                self.dead_letter(evicted, "capacity".to_string(), now);
            }
            return true;
        }
        incoming.priority == ActionPriority::Critical
    }

    /// Run one pass over the queue.
    ///
    /// Actions waiting on backoff stay put, and so does every later action
    /// for the same entity, so per-entity order is preserved.
    pub async fn process_queue(&mut self, now: DateTime<Utc>) -> ProcessReport {
        let mut report = ProcessReport::default();
        if self.paused {
            report.paused = true;
            report.remaining = self.actions.len();
            return report;
        }

        let pending = std::mem::take(&mut self.actions);
        let mut kept: VecDeque<QueuedAction> = VecDeque::new();
        let mut blocked: HashSet<(String, String)> = HashSet::new();

        for mut action in pending {
            let entity = action.entity_key();
            if blocked.contains(&entity) || !action.is_ready(now) {
                blocked.insert(entity);
                report.deferred += 1;
                kept.push_back(action);
                continue;
            }

            let Some(processor) = self.processors.get(&action.processor_key()) else {
                tracing::warn!(key = %action.processor_key(), "no processor registered");
                blocked.insert(entity);
                report.deferred += 1;
                kept.push_back(action);
                continue;
            };

            match processor(action.clone()).await {
                Ok(()) => {
                    tracing::debug!(action = %action.id, key = %action.processor_key(), "processed");
                    report.processed += 1;
                }
                Err(err) => {
                    action.retry_count += 1;
                    action.last_error = Some(err.message.clone());
                    action.error_type = Some(err.kind);

                    if err.kind.is_retryable() && action.retry_count <= self.config.max_retries {
                        let delay = Backoff::from_config(&self.config).delay_ms(action.retry_count - 1);
                        action.next_attempt_at = Some(now + millis(delay));
                        tracing::debug!(
                            action = %action.id,
                            attempt = action.retry_count,
                            delay_ms = delay,
                            error = %err,
                            "action failed, will retry"
                        );
                        report.retried += 1;
                        blocked.insert(entity);
                        kept.push_back(action);
                        continue;
                    }

                    let reason = if err.kind == SyncErrorKind::Business {
                        format!("rejected: {}", err.message)
                    } else {
                        format!("retries exhausted: {}", err.message)
                    };
                    if action.priority == ActionPriority::Low {
                        tracing::debug!(action = %action.id, %reason, "dropping low-priority action");
                        report.dropped += 1;
                    } else {
                        self.dead_letter(action, reason, now);
                        report.dead_lettered += 1;
                    }
                }
            }
        }

        self.actions = kept;
        report.remaining = self.actions.len();
        report
    }

    fn dead_letter(&mut self, action: QueuedAction, reason: String, now: DateTime<Utc>) {
        if self.dead_letters.iter().any(|item| item.action.id == action.id) {
            return;
        }
        tracing::warn!(
            action = %action.id,
            key = %action.processor_key(),
            %reason,
            "action dead-lettered"
        );
        self.dead_letters.push_back(DeadLetterItem {
            action,
            failed_at: now,
            reason,
        });
        while self.dead_letters.len() > self.config.dead_letter_capacity {
            self.dead_letters.pop_front();
        }
    }

    /// Move a dead-lettered action back to the tail of the queue with a
    /// fresh retry budget.
    pub fn retry_dead_letter(&mut self, id: Uuid) -> Result<()> {
        let index = self
            .dead_letters
            .iter()
            .position(|item| item.action.id == id)
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?;
        let Some(item) = self.dead_letters.remove(index) else {
            return Err(Error::NotFound(format!("dead letter {id}")));
        };
        let mut action = item.action;
        action.retry_count = 0;
        action.next_attempt_at = None;
        action.last_error = None;
        action.error_type = None;
        self.actions.push_back(action);
        Ok(())
    }

    pub fn dismiss_dead_letter(&mut self, id: Uuid) -> Result<DeadLetterItem> {
        let index = self
            .dead_letters
            .iter()
            .position(|item| item.action.id == id)
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))?;
        self.dead_letters
            .remove(index)
            .ok_or_else(|| Error::NotFound(format!("dead letter {id}")))
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> impl Iterator<Item = &QueuedAction> {
        self.actions.iter()
    }

    pub fn dead_letters(&self) -> impl Iterator<Item = &DeadLetterItem> {
        self.dead_letters.iter()
    }

    /// Earliest backoff deadline among waiting actions.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.actions
            .iter()
            .filter_map(|action| action.next_attempt_at)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn config() -> QueueConfig {
        QueueConfig::default()
    }

    fn update(entity: &str, now: DateTime<Utc>) -> QueuedAction {
        QueuedAction::new(
            ActionType::Update,
            "project",
            entity,
            serde_json::json!({ "name": entity }),
            now,
        )
    }

    fn failing(kind: SyncErrorKind, calls: Rc<RefCell<usize>>) -> Processor {
        Box::new(move |_action| {
            let calls = Rc::clone(&calls);
            async move {
                *calls.borrow_mut() += 1;
                Err(SyncError::new(kind, "boom"))
            }
            .boxed_local()
        })
    }

    fn recording(seen: Rc<RefCell<Vec<String>>>) -> Processor {
        Box::new(move |action| {
            let seen = Rc::clone(&seen);
            async move {
                seen.borrow_mut().push(action.entity_id);
                Ok(())
            }
            .boxed_local()
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff::from_config(&config());
        assert_eq!(backoff.delay_ms(0), 1000);
        assert_eq!(backoff.delay_ms(1), 2000);
        assert_eq!(backoff.delay_ms(5), 32_000);
        assert_eq!(backoff.delay_ms(6), 60_000);
        assert_eq!(backoff.delay_ms(200), 60_000);
    }

    #[tokio::test]
    async fn network_failures_dead_letter_exactly_once() {
        let calls = Rc::new(RefCell::new(0));
        let mut queue = ActionQueue::new(config());
        queue.register_processor(ActionType::Update, "project", failing(SyncErrorKind::Network, Rc::clone(&calls)));

        let mut now = Utc::now();
        queue.enqueue(update("p1", now), now);
        for _ in 0..10 {
            queue.process_queue(now).await;
            now += millis(120_000);
        }

        assert_eq!(*calls.borrow(), 6);
        assert!(queue.is_empty());
        let dead: Vec<&DeadLetterItem> = queue.dead_letters().collect();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].action.retry_count, 6);
        assert_eq!(dead[0].action.error_type, Some(SyncErrorKind::Network));
    }

    #[tokio::test]
    async fn business_errors_skip_retries() {
        let calls = Rc::new(RefCell::new(0));
        let mut queue = ActionQueue::new(config());
        queue.register_processor(ActionType::Update, "project", failing(SyncErrorKind::Business, Rc::clone(&calls)));
        let now = Utc::now();
        queue.enqueue(update("p1", now), now);
        queue.enqueue(update("p2", now).with_priority(ActionPriority::Low), now);

        let report = queue.process_queue(now).await;
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(*calls.borrow(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn backoff_defers_later_actions_for_same_entity() {
        let calls = Rc::new(RefCell::new(0));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut queue = ActionQueue::new(config());
        queue.register_processor(ActionType::Update, "project", failing(SyncErrorKind::Timeout, Rc::clone(&calls)));
        queue.register_processor(ActionType::Delete, "project", recording(Rc::clone(&seen)));

        let now = Utc::now();
        queue.enqueue(update("p1", now), now);
        queue.enqueue(
            QueuedAction::new(ActionType::Delete, "project", "p1", serde_json::Value::Null, now),
            now,
        );
        queue.enqueue(
            QueuedAction::new(ActionType::Delete, "project", "p2", serde_json::Value::Null, now),
            now,
        );

        let report = queue.process_queue(now).await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(*seen.borrow(), vec!["p2".to_string()]);
        assert_eq!(queue.next_attempt_at(), Some(now + millis(1000)));
    }

    #[tokio::test]
    async fn paused_queue_does_nothing() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut queue = ActionQueue::new(config());
        queue.register_processor(ActionType::Update, "project", recording(Rc::clone(&seen)));
        let now = Utc::now();
        queue.enqueue(update("p1", now), now);

        queue.pause();
        let report = queue.process_queue(now).await;
        assert!(report.paused);
        assert_eq!(report.remaining, 1);

        queue.resume();
        let report = queue.process_queue(now).await;
        assert_eq!(report.processed, 1);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn pending_updates_coalesce() {
        let mut queue = ActionQueue::new(config());
        let now = Utc::now();
        let first = queue.enqueue(update("p1", now), now);
        let mut second = update("p1", now);
        second.payload = serde_json::json!({ "name": "latest" });
        let outcome = queue.enqueue(second, now);

        let Enqueued::Queued(first_id) = first else {
            panic!("expected queued");
        };
        assert_eq!(outcome, Enqueued::Coalesced(first_id));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.actions().next().expect("action").payload["name"], "latest");
    }

    #[test]
    fn capacity_evicts_low_then_normal_never_critical() {
        let mut queue = ActionQueue::new(QueueConfig {
            capacity: 2,
            ..config()
        });
        let now = Utc::now();
        let create = |id: &str, priority| {
            QueuedAction::new(ActionType::Create, "task", id, serde_json::Value::Null, now).with_priority(priority)
        };

        queue.enqueue(create("low", ActionPriority::Low), now);
        queue.enqueue(create("normal", ActionPriority::Normal), now);
        queue.enqueue(create("c1", ActionPriority::Critical), now);
        let ids: Vec<&str> = queue.actions().map(|a| a.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["normal", "c1"]);
        assert_eq!(queue.dead_letters().count(), 0);

        queue.enqueue(create("c2", ActionPriority::Critical), now);
        let ids: Vec<&str> = queue.actions().map(|a| a.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        let dead: Vec<&DeadLetterItem> = queue.dead_letters().collect();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "capacity");

        let outcome = queue.enqueue(create("late", ActionPriority::Low), now);
        assert!(matches!(outcome, Enqueued::Rejected(_)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn retry_and_dismiss_dead_letters() {
        let calls = Rc::new(RefCell::new(0));
        let mut queue = ActionQueue::new(config());
        queue.register_processor(ActionType::Update, "project", failing(SyncErrorKind::Business, Rc::clone(&calls)));
        let now = Utc::now();
        queue.enqueue(update("p1", now), now);
        queue.enqueue(update("p2", now), now);
        queue.process_queue(now).await;

        let ids: Vec<Uuid> = queue.dead_letters().map(|item| item.action.id).collect();
        assert_eq!(ids.len(), 2);

        queue.retry_dead_letter(ids[0]).expect("retry");
        let retried = queue.actions().next().expect("requeued");
        assert_eq!(retried.retry_count, 0);
        assert!(retried.last_error.is_none());

        queue.dismiss_dead_letter(ids[1]).expect("dismiss");
        assert_eq!(queue.dead_letters().count(), 0);
        assert!(matches!(queue.dismiss_dead_letter(ids[1]), Err(Error::NotFound(_))));
        assert!(matches!(queue.retry_dead_letter(Uuid::new_v4()), Err(Error::NotFound(_))));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut queue = ActionQueue::new(config());
        let now = Utc::now();
        queue.enqueue(update("p1", now), now);
        let json = serde_json::to_value(queue.state()).expect("json");
        assert_eq!(json["actions"][0]["type"], "update");
        assert_eq!(json["actions"][0]["entityType"], "project");

        let state: QueueState = serde_json::from_value(json).expect("parse");
        let restored = ActionQueue::from_state(state, config());
        assert_eq!(restored.len(), 1);
    }
}
