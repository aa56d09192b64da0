//! Rank allocation between siblings.
//!
//! Ranks are dense reals that only order tasks; their absolute values carry
//! no meaning across rebalances. Inserts take the midpoint of the two
//! neighbors, and signal `needs_rebalance` instead of failing once a gap
//! gets too narrow.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::config::LayoutConfig;
use crate::error::{Error, Result};
use crate::model::{Project, Task};

/// Outcome of [`compute_insert_rank`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsertRank {
    pub rank: f64,
    pub needs_rebalance: bool,
}

/// Outcome of [`apply_refusal_strategy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefusalOutcome {
    pub ok: bool,
    pub rank: f64,
}

impl RefusalOutcome {
    pub fn into_result(self, task_id: &str) -> Result<f64> {
        if self.ok {
            Ok(self.rank)
        } else {
            Err(Error::NoSpace {
                task_id: task_id.to_string(),
            })
        }
    }
}

/// First rank handed out in an empty stage.
pub fn stage_base(stage: Option<u32>, layout: &LayoutConfig) -> f64 {
    stage.map(f64::from).unwrap_or(0.0) * layout.stage_rank_span
}

/// Default rank derived from a task's stage and 1-based order.
pub fn default_rank(stage: Option<u32>, order: u32, layout: &LayoutConfig) -> f64 {
    stage_base(stage, layout) + f64::from(order.saturating_sub(1)) * layout.rank_step
}

/// Total order used everywhere ranks are compared: rank, then order, then id.
pub fn compare_by_rank(a: &Task, b: &Task) -> Ordering {
    a.rank_value()
        .total_cmp(&b.rank_value())
        .then_with(|| a.order.cmp(&b.order))
        .then_with(|| a.id.cmp(&b.id))
}

/// Compute the rank for a task inserted into a stage.
///
/// `siblings` must not contain the task being placed. Without `before_id`
/// (or with an id that is not among the siblings) the task goes to the tail.
pub fn compute_insert_rank(
    stage: Option<u32>,
    siblings: &[&Task],
    before_id: Option<&str>,
    parent_rank: Option<f64>,
    layout: &LayoutConfig,
) -> InsertRank {
    let mut sorted: Vec<&Task> = siblings.to_vec();
    sorted.sort_by(|a, b| compare_by_rank(a, b));

    let position = before_id.and_then(|id| sorted.iter().position(|task| task.id == id));
    let (prev, next) = match position {
        Some(index) => (
            index.checked_sub(1).map(|i| sorted[i].rank_value()),
            Some(sorted[index].rank_value()),
        ),
        None => (sorted.last().map(|task| task.rank_value()), None),
    };

    let step = layout.rank_step;
    let (rank, gap) = match (prev, next) {
        (Some(prev), Some(next)) => {
            let rank = (prev + next) / 2.0;
            (rank, (next - prev) / 2.0)
        }
        (Some(prev), None) => (prev + step, step),
        (None, Some(next)) => (next - step, step),
        (None, None) => {
            let base = match parent_rank {
                Some(parent) => parent + step,
                None => stage_base(stage, layout),
            };
            (base, step)
        }
    };

    InsertRank {
        rank,
        needs_rebalance: gap < layout.min_rank_gap,
    }
}

/// Clamp a candidate rank into the open window `(parent_rank, min_child_rank)`.
///
/// Upward clamps land at `parent_rank + step`, downward clamps at
/// `min_child_rank - step`. When the window is too narrow for either clamp
/// the placement is refused rather than producing an inconsistent tree.
pub fn apply_refusal_strategy(
    target_id: &str,
    candidate: f64,
    parent_rank: Option<f64>,
    min_child_rank: Option<f64>,
    layout: &LayoutConfig,
) -> RefusalOutcome {
    let step = layout.rank_step;
    let mut rank = candidate;

    if let Some(parent) = parent_rank {
        if rank <= parent {
            rank = parent + step;
        }
    }
    if let Some(min_child) = min_child_rank {
        if rank >= min_child {
            rank = min_child - step;
        }
    }

    let above_parent = parent_rank.map(|parent| rank > parent).unwrap_or(true);
    let below_children = min_child_rank.map(|child| rank < child).unwrap_or(true);
    let ok = above_parent && below_children;
    if !ok {
        tracing::debug!(
            task = target_id,
            candidate,
            ?parent_rank,
            ?min_child_rank,
            "rank window collapsed"
        );
    }
    RefusalOutcome { ok, rank }
}

/// Re-spread the ranks of one stage evenly, keeping their current order.
/// Returns the number of tasks touched.
pub fn rebalance_stage_ranks(project: &mut Project, stage: Option<u32>, layout: &LayoutConfig) -> usize {
    let ordered = ordered_stage_ids(project, stage);
    spread(project, stage, &ordered, layout)
}

/// Assign ranks so the stage follows `ordered_ids`; stage tasks missing from
/// the list keep their relative order after the listed ones.
pub fn reorder_stage_ranks(
    project: &mut Project,
    stage: Option<u32>,
    ordered_ids: &[String],
    layout: &LayoutConfig,
) -> Result<usize> {
    let current = ordered_stage_ids(project, stage);
    let in_stage: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut listed: HashSet<&str> = HashSet::with_capacity(ordered_ids.len());
    let mut ordered: Vec<String> = Vec::with_capacity(current.len());
    for id in ordered_ids {
        if !in_stage.contains(id.as_str()) {
            return Err(Error::Validation(format!(
                "task {id} is not in stage {}",
                stage_label(stage)
            )));
        }
        if !listed.insert(id.as_str()) {
            return Err(Error::Validation(format!("task {id} listed twice")));
        }
        ordered.push(id.clone());
    }
    for id in &current {
        if !listed.contains(id.as_str()) {
            ordered.push(id.clone());
        }
    }
    Ok(spread(project, stage, &ordered, layout))
}

pub fn stage_label(stage: Option<u32>) -> String {
    stage
        .map(|stage| stage.to_string())
        .unwrap_or_else(|| "unassigned".to_string())
}

fn ordered_stage_ids(project: &Project, stage: Option<u32>) -> Vec<String> {
    let mut tasks = project.stage_tasks(stage);
    tasks.sort_by(|a, b| compare_by_rank(a, b));
    tasks.into_iter().map(|task| task.id.clone()).collect()
}

fn spread(project: &mut Project, stage: Option<u32>, ordered: &[String], layout: &LayoutConfig) -> usize {
    let step = layout.rank_step;
    let index: HashMap<&str, usize> = project
        .tasks
        .iter()
        .enumerate()
        .map(|(i, task)| (task.id.as_str(), i))
        .collect();
    // Every respread rank must stay above every parent of the stage.
    let parent_ceiling = ordered
        .iter()
        .filter_map(|id| index.get(id.as_str()))
        .filter_map(|&i| project.tasks[i].parent_id.as_deref())
        .filter_map(|parent| index.get(parent))
        .map(|&i| project.tasks[i].rank_value())
        .fold(f64::NEG_INFINITY, f64::max);
    let mut base = stage_base(stage, layout);
    if parent_ceiling.is_finite() && base <= parent_ceiling {
        base = parent_ceiling + step;
    }

    let slots: Vec<usize> = ordered
        .iter()
        .filter_map(|id| index.get(id.as_str()).copied())
        .collect();
    for (position, slot) in slots.into_iter().enumerate() {
        project.tasks[slot].rank = Some(base + position as f64 * step);
    }
    ordered.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn layout() -> LayoutConfig {
        LayoutConfig::default()
    }

    fn ranked(id: &str, stage: u32, rank: f64) -> Task {
        let mut task = Task::new(id, Some(stage), Utc::now());
        task.id = id.to_string();
        task.rank = Some(rank);
        task
    }

    #[test]
    fn tail_insert_steps_past_last_sibling() {
        let a = ranked("a", 1, 10_000.0);
        let b = ranked("b", 1, 10_500.0);
        let result = compute_insert_rank(Some(1), &[&a, &b], None, None, &layout());
        assert_eq!(result.rank, 11_000.0);
        assert!(!result.needs_rebalance);
    }

    #[test]
    fn before_insert_takes_midpoint() {
        let a = ranked("a", 1, 10_000.0);
        let b = ranked("b", 1, 10_500.0);
        let result = compute_insert_rank(Some(1), &[&b, &a], Some("b"), None, &layout());
        assert_eq!(result.rank, 10_250.0);
        assert!(!result.needs_rebalance);
    }

    #[test]
    fn head_insert_steps_below_first() {
        let a = ranked("a", 1, 10_000.0);
        let result = compute_insert_rank(Some(1), &[&a], Some("a"), None, &layout());
        assert_eq!(result.rank, 9_500.0);
    }

    #[test]
    fn empty_stage_uses_stage_base_or_parent() {
        let result = compute_insert_rank(Some(2), &[], None, None, &layout());
        assert_eq!(result.rank, 20_000.0);
        let result = compute_insert_rank(Some(2), &[], None, Some(10_000.0), &layout());
        assert_eq!(result.rank, 10_500.0);
        let result = compute_insert_rank(None, &[], None, None, &layout());
        assert_eq!(result.rank, 0.0);
    }

    #[test]
    fn narrow_gap_requests_rebalance() {
        let a = ranked("a", 1, 10_000.0);
        let b = ranked("b", 1, 10_080.0);
        let result = compute_insert_rank(Some(1), &[&a, &b], Some("b"), None, &layout());
        assert_eq!(result.rank, 10_040.0);
        assert!(result.needs_rebalance);
    }

    #[test]
    fn unknown_before_id_appends() {
        let a = ranked("a", 1, 10_000.0);
        let result = compute_insert_rank(Some(1), &[&a], Some("missing"), None, &layout());
        assert_eq!(result.rank, 10_500.0);
    }

    #[test]
    fn refusal_clamps_up_to_parent() {
        let outcome = apply_refusal_strategy("t", 9_000.0, Some(10_000.0), None, &layout());
        assert!(outcome.ok);
        assert_eq!(outcome.rank, 10_500.0);
    }

    #[test]
    fn refusal_clamps_down_below_children() {
        let outcome = apply_refusal_strategy("t", 13_000.0, Some(10_000.0), Some(12_000.0), &layout());
        assert!(outcome.ok);
        assert_eq!(outcome.rank, 11_500.0);
    }

    #[test]
    fn refusal_rejects_collapsed_window() {
        let outcome = apply_refusal_strategy("t", 9_000.0, Some(10_000.0), Some(10_300.0), &layout());
        assert!(!outcome.ok);
        assert!(matches!(
            outcome.into_result("t"),
            Err(Error::NoSpace { .. })
        ));
    }

    #[test]
    fn stage_respread_keeps_order_and_clears_parents() {
        let mut project = Project::new("p", Utc::now());
        project.tasks = vec![
            ranked("root", 1, 25_000.0),
            ranked("x", 2, 20_010.0),
            ranked("y", 2, 20_000.0),
        ];
        project.tasks[1].parent_id = Some("root".to_string());

        assert_eq!(rebalance_stage_ranks(&mut project, Some(2), &layout()), 2);
        let y = project.task("y").expect("y").rank_value();
        let x = project.task("x").expect("x").rank_value();
        assert_eq!(y, 25_500.0);
        assert_eq!(x, 26_000.0);
    }

    #[test]
    fn reorder_follows_requested_ids() {
        let mut project = Project::new("p", Utc::now());
        project.tasks = vec![
            ranked("a", 1, 10_000.0),
            ranked("b", 1, 10_500.0),
            ranked("c", 1, 11_000.0),
        ];
        reorder_stage_ranks(&mut project, Some(1), &["c".to_string(), "a".to_string()], &layout())
            .expect("reorder");
        let mut ids: Vec<&Task> = project.tasks.iter().collect();
        ids.sort_by(|a, b| compare_by_rank(a, b));
        let ids: Vec<&str> = ids.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn reorder_rejects_foreign_ids() {
        let mut project = Project::new("p", Utc::now());
        project.tasks = vec![ranked("a", 1, 10_000.0), ranked("z", 2, 20_000.0)];
        let err = reorder_stage_ranks(&mut project, Some(1), &["z".to_string()], &layout())
            .expect_err("foreign id");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn reorder_rejects_duplicate_ids() {
        let mut project = Project::new("p", Utc::now());
        project.tasks = vec![ranked("a", 1, 10_000.0), ranked("b", 1, 10_500.0)];
        let err = reorder_stage_ranks(
            &mut project,
            Some(1),
            &["b".to_string(), "a".to_string(), "b".to_string()],
            &layout(),
        )
        .expect_err("duplicate id");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn crowded_stage_respreads_in_one_pass() {
        let count = 20_000;
        let mut project = Project::new("p", Utc::now());
        project.tasks = (0..count)
            .map(|i| ranked(&format!("t{i:05}"), 3, 30_000.0 + f64::from(i) * 0.01))
            .collect();
        let reversed: Vec<String> = (0..count).rev().map(|i| format!("t{i:05}")).collect();

        let started = std::time::Instant::now();
        assert_eq!(rebalance_stage_ranks(&mut project, Some(3), &layout()), count as usize);
        reorder_stage_ranks(&mut project, Some(3), &reversed, &layout()).expect("reorder");
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        let first = project.task("t19999").expect("first").rank_value();
        let last = project.task("t00000").expect("last").rank_value();
        assert_eq!(first, 30_000.0);
        assert_eq!(last, 30_000.0 + f64::from(count - 1) * 500.0);
    }
}
