//! Debounced per-stage rank rebalancing.
//!
//! A stage whose gaps ran out is marked pending and locked. Inserts and moves
//! into a locked stage fail with a retryable [`Error::RankConflict`] until the
//! debounced [`StageRebalanceCoordinator::perform`] re-spreads its ranks.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::config::LayoutConfig;
use crate::error::{Error, Result};
use crate::model::Project;
use crate::rank::{rebalance_stage_ranks, stage_label};
use crate::timer::{Scheduler, TimerKey};

#[derive(Debug, Default)]
pub struct StageRebalanceCoordinator {
    pending: BTreeSet<Option<u32>>,
    locked: BTreeSet<Option<u32>>,
}

impl StageRebalanceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `stage` for rebalancing and (re)arm the debounce timer.
    pub fn request(
        &mut self,
        stage: Option<u32>,
        now: DateTime<Utc>,
        scheduler: &mut Scheduler,
        layout: &LayoutConfig,
    ) {
        if self.pending.insert(stage) {
            tracing::debug!(stage = %stage_label(stage), "stage rebalance requested");
        }
        self.locked.insert(stage);
        scheduler.schedule_in(TimerKey::StageRebalance, now, layout.rebalance_debounce_ms);
    }

    /// Fail if `stage` is waiting for a rebalance.
    pub fn check(&self, stage: Option<u32>) -> Result<()> {
        if self.locked.contains(&stage) {
            return Err(Error::RankConflict {
                stage: stage.unwrap_or(0),
            });
        }
        Ok(())
    }

    pub fn is_locked(&self, stage: Option<u32>) -> bool {
        self.locked.contains(&stage)
    }

    pub fn pending(&self) -> impl Iterator<Item = Option<u32>> + '_ {
        self.pending.iter().copied()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Re-spread every pending stage of `project` and release the locks.
    /// Returns the stages that were rebalanced.
    pub fn perform(&mut self, project: &mut Project, layout: &LayoutConfig) -> Vec<Option<u32>> {
        let stages: Vec<Option<u32>> = std::mem::take(&mut self.pending).into_iter().collect();
        for &stage in &stages {
            let count = rebalance_stage_ranks(project, stage, layout);
            tracing::debug!(stage = %stage_label(stage), count, "stage ranks re-spread");
        }
        self.locked.clear();
        stages
    }

    /// Drop pending work without touching any document.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.locked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    #[test]
    fn locked_stage_rejects_until_performed() {
        let layout = LayoutConfig::default();
        let mut scheduler = Scheduler::new();
        let mut coordinator = StageRebalanceCoordinator::new();
        let now = Utc::now();

        coordinator.request(Some(2), now, &mut scheduler, &layout);
        coordinator.request(Some(2), now, &mut scheduler, &layout);
        assert!(scheduler.is_scheduled(TimerKey::StageRebalance));
        let err = coordinator.check(Some(2)).expect_err("locked");
        assert!(err.is_retryable());
        assert_eq!(err.code(), "LAYOUT_RANK_CONFLICT");
        assert!(coordinator.check(Some(1)).is_ok());

        let mut project = Project::new("p", now);
        let mut a = Task::new("a", Some(2), now);
        a.rank = Some(20_000.0);
        let mut b = Task::new("b", Some(2), now);
        b.rank = Some(20_010.0);
        project.tasks = vec![a, b];

        assert_eq!(coordinator.perform(&mut project, &layout), vec![Some(2)]);
        assert!(coordinator.check(Some(2)).is_ok());
        assert!(!coordinator.has_pending());
        assert_eq!(project.tasks[0].rank, Some(20_000.0));
        assert_eq!(project.tasks[1].rank, Some(20_500.0));
    }
}
