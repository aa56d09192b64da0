//! stagewise task command implementations.

use chrono::{DateTime, Utc};

use super::Context;
use crate::error::{Error, Result};
use crate::model::{Project, TaskPriority, TaskStatus, UNASSIGNED_DISPLAY_ID};
use crate::output::{emit_success, HumanOutput};
use crate::rank::stage_label;
use crate::store::TaskFields;
use crate::sync::SyncEngine;

pub struct AddOptions {
    pub title: String,
    pub stage: Option<u32>,
    pub parent: Option<String>,
    pub sibling: bool,
    pub content: String,
}

pub struct MoveOptions {
    pub task: String,
    pub stage: Option<u32>,
    pub before: Option<String>,
    pub parent: Option<String>,
}

pub struct EditOptions {
    pub task: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub due: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(serde::Serialize)]
struct TaskChangeOutput {
    project_id: String,
    task_id: String,
    display_id: String,
    stage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    affected: Option<usize>,
    queued: usize,
}

#[derive(serde::Serialize)]
struct TaskLine {
    id: String,
    short_id: String,
    display_id: String,
    title: String,
    stage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    rank: f64,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<TaskPriority>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    deleted: bool,
}

#[derive(serde::Serialize)]
struct StageGroup {
    #[serde(skip)]
    heading: String,
    stage: Option<u32>,
    locked: bool,
    tasks: Vec<TaskLine>,
}

#[derive(serde::Serialize)]
struct TaskListOutput {
    project_id: String,
    total: usize,
    stages: Vec<StageGroup>,
}

pub async fn run_add(ctx: &Context, options: AddOptions) -> Result<()> {
    let mut engine = ctx.open()?;
    let parent = resolve_opt(&engine, options.parent.as_deref())?;
    let id = engine.store_mut().add_task(
        &options.title,
        &options.content,
        options.stage,
        parent.as_deref(),
        options.sibling,
    )?;
    finish(ctx, &mut engine, "task add", "Task added", &id, None).await
}

pub async fn run_move(ctx: &Context, options: MoveOptions) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = engine.store().resolve_task_id(&options.task)?;
    let before = resolve_opt(&engine, options.before.as_deref())?;
    let parent = resolve_opt(&engine, options.parent.as_deref())?;
    engine
        .store_mut()
        .move_task_to_stage(&id, options.stage, before.as_deref(), parent.as_deref())?;
    finish(ctx, &mut engine, "task move", "Task moved", &id, None).await
}

pub async fn run_detach(ctx: &Context, task: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = engine.store().resolve_task_id(task)?;
    engine.store_mut().detach_task(&id)?;
    finish(ctx, &mut engine, "task detach", "Task detached", &id, None).await
}

pub async fn run_reorder(ctx: &Context, stage: u32, tasks: &[String]) -> Result<()> {
    let mut engine = ctx.open()?;
    let ids = tasks
        .iter()
        .map(|task| engine.store().resolve_task_id(task))
        .collect::<Result<Vec<_>>>()?;
    engine.store_mut().reorder_stage(Some(stage), &ids)?;
    let first = ids.first().cloned().unwrap_or_default();
    finish(ctx, &mut engine, "task reorder", "Stage reordered", &first, Some(ids.len())).await
}

pub async fn run_edit(ctx: &Context, options: EditOptions) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = engine.store().resolve_task_id(&options.task)?;

    let fields = TaskFields {
        title: options.title,
        status: options.status.as_deref().map(parse_status).transpose()?,
        priority: options.priority.as_deref().map(parse_priority).transpose()?,
        due_date: options.due.as_deref().map(parse_due).transpose()?,
        tags: options.tags,
    };
    if fields.is_empty() && options.content.is_none() {
        return Err(Error::Validation("nothing to edit; pass at least one field".to_string()));
    }
    if let Some(content) = options.content.as_deref() {
        engine.store_mut().update_task_content(&id, content)?;
    }
    if !fields.is_empty() {
        engine.store_mut().update_task_fields(&id, fields)?;
    }
    finish(ctx, &mut engine, "task edit", "Task updated", &id, None).await
}

pub async fn run_delete(ctx: &Context, task: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = engine.store().resolve_task_id(task)?;
    let count = engine.store_mut().delete_task(&id)?;
    finish(ctx, &mut engine, "task delete", "Task deleted", &id, Some(count)).await
}

pub async fn run_restore(ctx: &Context, task: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = engine.store().resolve_task_id(task)?;
    let count = engine.store_mut().restore_task(&id)?;
    finish(ctx, &mut engine, "task restore", "Task restored", &id, Some(count)).await
}

pub async fn run_purge(ctx: &Context, task: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = engine.store().resolve_task_id(task)?;
    let count = engine.store_mut().permanently_delete_task(&id)?;
    finish(ctx, &mut engine, "task purge", "Task purged", &id, Some(count)).await
}

pub fn run_list(ctx: &Context, include_deleted: bool) -> Result<()> {
    let engine = ctx.open()?;
    let store = engine.store();
    let project = store.active_project()?;

    let mut stages: Vec<StageGroup> = store
        .tasks_by_stage()
        .iter()
        .map(|(stage, tasks)| StageGroup {
            heading: match stage {
                Some(stage) => format!("Stage {stage}"),
                None => "Unassigned".to_string(),
            },
            stage: *stage,
            locked: store.is_stage_locked(*stage),
            tasks: tasks.iter().map(|task| task_line(project, task)).collect(),
        })
        .collect();
    if include_deleted {
        let deleted: Vec<TaskLine> = project
            .tasks
            .iter()
            .filter(|task| task.is_deleted())
            .map(|task| task_line(project, task))
            .collect();
        if !deleted.is_empty() {
            stages.push(StageGroup {
                heading: "Deleted".to_string(),
                stage: None,
                locked: false,
                tasks: deleted,
            });
        }
    }
    let output = TaskListOutput {
        project_id: project.id.clone(),
        total: stages.iter().map(|group| group.tasks.len()).sum(),
        stages,
    };

    let mut human = HumanOutput::new(format!("Tasks in {}", project.name));
    human.push_summary("Total", output.total.to_string());
    for group in &output.stages {
        human.push_detail(format!("{}:", group.heading));
        for task in &group.tasks {
            let mut line = format!("  {:<8} {} {}", task.display_id, task.short_id, task.title);
            if task.status != TaskStatus::Active {
                line.push_str(&format!(" [{}]", status_label(task.status)));
            }
            if task.deleted {
                line.push_str(" [deleted]");
            }
            human.push_detail(line);
        }
    }
    emit_success(ctx.output(), "task list", &output, Some(&human))
}

async fn finish(
    ctx: &Context,
    engine: &mut SyncEngine,
    command: &str,
    header: &str,
    task_id: &str,
    affected: Option<usize>,
) -> Result<()> {
    let report = ctx.save(engine).await?;
    let project = engine.store().active_project()?;
    let task = project.task(task_id);
    let output = TaskChangeOutput {
        project_id: project.id.clone(),
        task_id: task_id.to_string(),
        display_id: task
            .map(|task| task.display_id.clone())
            .unwrap_or_else(|| UNASSIGNED_DISPLAY_ID.to_string()),
        stage: task.and_then(|task| task.stage),
        affected,
        queued: report.enqueued,
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("Task", format!("{} ({})", output.display_id, output.task_id));
    human.push_summary("Stage", stage_label(output.stage));
    if let Some(affected) = affected {
        human.push_summary("Affected", affected.to_string());
    }
    emit_success(ctx.output(), command, &output, Some(&human))
}

fn resolve_opt(engine: &SyncEngine, reference: Option<&str>) -> Result<Option<String>> {
    reference
        .map(|reference| engine.store().resolve_task_id(reference))
        .transpose()
}

fn task_line(project: &Project, task: &crate::model::Task) -> TaskLine {
    TaskLine {
        id: task.id.clone(),
        short_id: task.short_id.clone(),
        display_id: task.display_id.clone(),
        title: task.title.clone(),
        stage: task.stage,
        parent: task
            .parent_id
            .as_deref()
            .and_then(|parent| project.task(parent))
            .map(|parent| parent.display_id.clone()),
        rank: task.rank_value(),
        status: task.status,
        priority: task.priority,
        tags: task.tags.clone(),
        deleted: task.is_deleted(),
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| Error::Validation(format!("unknown status: {raw}")))
}

fn parse_priority(raw: &str) -> Result<Option<TaskPriority>> {
    if raw.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    TaskPriority::parse(raw)
        .map(Some)
        .ok_or_else(|| Error::Validation(format!("unknown priority: {raw}")))
}

fn parse_due(raw: &str) -> Result<Option<DateTime<Utc>>> {
    if raw.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|due| Some(due.with_timezone(&Utc)))
        .map_err(|err| Error::Validation(format!("invalid due date {raw}: {err}")))
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Active => "active",
        TaskStatus::Completed => "completed",
        TaskStatus::Archived => "archived",
    }
}
