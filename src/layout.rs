//! Whole-document structural pass.
//!
//! [`rebalance`] is the single place tree validity is restored. It runs after
//! every structural mutation, after a conflict merge and before persistence.
//! Pass order:
//!
//! 1. normalize parent links (unassigned tasks and missing parents detach)
//! 2. reject cycles
//! 3. default missing ranks from `(stage, order)`
//! 4. cascade: children end up in a later stage and above the running floor
//! 5. renumber `order` per stage and default grid positions
//! 6. assign display ids
//!
//! Soft-deleted tasks are not laid out.

use std::collections::{BTreeMap, HashMap};

use crate::config::LayoutConfig;
use crate::error::{Error, Result};
use crate::model::{Project, UNASSIGNED_DISPLAY_ID};
use crate::rank::{compare_by_rank, default_rank};

/// Rebalance a copy of `project`. The input is never modified.
pub fn rebalance(project: &Project, layout: &LayoutConfig) -> Result<Project> {
    let mut next = project.clone();
    rebalance_in_place(&mut next, layout)?;
    Ok(next)
}

/// Rebalance `project` in place. On error the project may be partially
/// normalized, so callers work on a draft.
pub fn rebalance_in_place(project: &mut Project, layout: &LayoutConfig) -> Result<()> {
    let index: HashMap<String, usize> = project
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| !task.is_deleted())
        .map(|(i, task)| (task.id.clone(), i))
        .collect();

    normalize_links(project, &index);

    if let Some(task_id) = detect_cycle(project) {
        return Err(Error::CycleDetected { task_id });
    }

    for task in project.tasks.iter_mut().filter(|task| !task.is_deleted()) {
        if !task.rank.map(f64::is_finite).unwrap_or(false) {
            task.rank = Some(default_rank(task.stage, task.order, layout));
        }
    }

    let children = children_by_parent(project, &index);
    let pushed = cascade(project, &children, layout)?;
    renumber_stages(project, layout);
    assign_display_ids(project, &children);

    tracing::debug!(
        project = %project.id,
        tasks = index.len(),
        pushed,
        "rebalanced"
    );
    Ok(())
}

/// Id of a task whose parent chain loops back on itself, if any.
pub fn detect_cycle(project: &Project) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Walking,
        Done,
    }

    let parents: HashMap<&str, Option<&str>> = project
        .active_tasks()
        .map(|task| (task.id.as_str(), task.parent_id.as_deref()))
        .collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for task in project.active_tasks() {
        let mut path: Vec<&str> = Vec::new();
        let mut current = Some(task.id.as_str());
        while let Some(id) = current {
            match marks.get(id) {
                Some(Mark::Done) => break,
                Some(Mark::Walking) => return Some(id.to_string()),
                None => {}
            }
            marks.insert(id, Mark::Walking);
            path.push(id);
            current = parents
                .get(id)
                .copied()
                .flatten()
                .filter(|parent| parents.contains_key(parent));
        }
        for id in path {
            marks.insert(id, Mark::Done);
        }
    }
    None
}

/// Whether re-parenting `task_id` under `new_parent` would close a loop.
pub fn would_create_cycle(project: &Project, task_id: &str, new_parent: &str) -> bool {
    task_id == new_parent || project.is_descendant(task_id, new_parent)
}

/// Lowest rank among the live direct children of `task_id`.
pub fn min_child_rank(project: &Project, task_id: &str) -> Option<f64> {
    project
        .children_of(task_id)
        .iter()
        .map(|child| child.rank_value())
        .reduce(f64::min)
}

/// Letter suffix for the `index`-th child. Wraps after 26 siblings, so
/// display ids of larger families repeat.
pub fn child_letter(index: usize) -> char {
    // index % 26 always fits in a u8.
    char::from(b'a' + (index % 26) as u8)
}

fn normalize_links(project: &mut Project, index: &HashMap<String, usize>) {
    let stages: Vec<Option<u32>> = project.tasks.iter().map(|task| task.stage).collect();
    for task in project.tasks.iter_mut().filter(|task| !task.is_deleted()) {
        if task.stage.is_none() {
            task.parent_id = None;
            task.display_id = UNASSIGNED_DISPLAY_ID.to_string();
            continue;
        }
        let Some(parent_id) = task.parent_id.as_deref() else {
            continue;
        };
        let parent_staged = index
            .get(parent_id)
            .map(|&i| stages[i].is_some())
            .unwrap_or(false);
        if !parent_staged {
            tracing::debug!(task = %task.id, parent = parent_id, "detaching from unusable parent");
            task.parent_id = None;
        }
    }
}

fn children_by_parent(project: &Project, index: &HashMap<String, usize>) -> HashMap<usize, Vec<usize>> {
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, task) in project.tasks.iter().enumerate() {
        if task.is_deleted() {
            continue;
        }
        if let Some(&parent) = task.parent_id.as_deref().and_then(|id| index.get(id)) {
            children.entry(parent).or_default().push(i);
        }
    }
    children
}

fn roots(project: &Project) -> Vec<usize> {
    let mut roots: Vec<usize> = project
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| !task.is_deleted() && task.stage.is_some() && task.parent_id.is_none())
        .map(|(i, _)| i)
        .collect();
    roots.sort_by(|&a, &b| {
        let (a, b) = (&project.tasks[a], &project.tasks[b]);
        a.stage.cmp(&b.stage).then_with(|| compare_by_rank(a, b))
    });
    roots
}

fn sorted_children(project: &Project, children: &HashMap<usize, Vec<usize>>, parent: usize) -> Vec<usize> {
    let mut kids = children.get(&parent).cloned().unwrap_or_default();
    kids.sort_by(|&a, &b| compare_by_rank(&project.tasks[a], &project.tasks[b]));
    kids
}

/// Iterative walk from every root. Each child is moved to a later stage than
/// its parent when needed and pushed above the running floor (the parent's
/// rank, then each previously placed sibling). Returns the number of pushes.
fn cascade(
    project: &mut Project,
    children: &HashMap<usize, Vec<usize>>,
    layout: &LayoutConfig,
) -> Result<usize> {
    let mut visited = vec![false; project.tasks.len()];
    let mut stack: Vec<(usize, usize)> = roots(project).into_iter().map(|root| (root, 0)).collect();
    let mut pushed = 0;

    while let Some((node, depth)) = stack.pop() {
        if visited[node] {
            return Err(Error::CycleDetected {
                task_id: project.tasks[node].id.clone(),
            });
        }
        visited[node] = true;

        let kids = sorted_children(project, children, node);
        if kids.is_empty() {
            continue;
        }
        if depth >= layout.max_depth {
            return Err(Error::Validation(format!(
                "task {} is nested deeper than {} levels",
                project.tasks[node].id, layout.max_depth
            )));
        }

        let parent_stage = project.tasks[node].stage.unwrap_or(0);
        let mut floor = project.tasks[node].rank_value();
        for kid in kids {
            let task = &mut project.tasks[kid];
            if task.stage.map(|stage| stage <= parent_stage).unwrap_or(true) {
                task.stage = Some(parent_stage + 1);
            }
            if task.rank_value() <= floor {
                task.rank = Some(floor + layout.rank_step);
                pushed += 1;
            }
            floor = task.rank_value();
            stack.push((kid, depth + 1));
        }
    }
    Ok(pushed)
}

fn renumber_stages(project: &mut Project, layout: &LayoutConfig) {
    let mut by_stage: BTreeMap<Option<u32>, Vec<usize>> = BTreeMap::new();
    for (i, task) in project.tasks.iter().enumerate() {
        if !task.is_deleted() {
            by_stage.entry(task.stage).or_default().push(i);
        }
    }

    for (stage, mut members) in by_stage {
        members.sort_by(|&a, &b| compare_by_rank(&project.tasks[a], &project.tasks[b]));
        let column = f64::from(stage.unwrap_or(0)) * layout.grid_column_width;
        for (position, i) in members.into_iter().enumerate() {
            let task = &mut project.tasks[i];
            task.order = u32::try_from(position + 1).unwrap_or(u32::MAX);
            if task.x.is_none() {
                task.x = Some(column);
            }
            if task.y.is_none() {
                task.y = Some(position as f64 * layout.grid_row_height);
            }
        }
    }
}

fn assign_display_ids(project: &mut Project, children: &HashMap<usize, Vec<usize>>) {
    let mut stack: Vec<usize> = Vec::new();
    for (position, root) in roots(project).into_iter().enumerate() {
        project.tasks[root].display_id = (position + 1).to_string();
        stack.push(root);
    }

    while let Some(node) = stack.pop() {
        let prefix = project.tasks[node].display_id.clone();
        for (position, kid) in sorted_children(project, children, node).into_iter().enumerate() {
            project.tasks[kid].display_id = format!("{prefix},{}", child_letter(position));
            stack.push(kid);
        }
    }
}
