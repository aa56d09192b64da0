//! stagewise checkpoint command implementations.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Context;
use crate::checkpoint::{Checkpoint, CheckpointFilter, CheckpointStore};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};

#[derive(serde::Serialize)]
struct CheckpointLine {
    id: Uuid,
    project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    version: u64,
    tasks: usize,
    created_at: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointLine {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            id: checkpoint.id,
            project_id: checkpoint.project_id.clone(),
            label: checkpoint.label.clone(),
            version: checkpoint.version,
            tasks: checkpoint.project.active_tasks().count(),
            created_at: checkpoint.created_at,
        }
    }
}

#[derive(serde::Serialize)]
struct CheckpointListOutput {
    total: usize,
    checkpoints: Vec<CheckpointLine>,
}

#[derive(serde::Serialize)]
struct CheckpointRemoveOutput {
    id: Uuid,
}

pub fn run_create(ctx: &Context, label: Option<String>) -> Result<()> {
    let engine = ctx.open()?;
    let store = engine.store();
    let project = store.active_project()?;
    let checkpoint = Checkpoint::new(project, Some(store.config().owner.id.clone()), label, store.now());
    let path = CheckpointStore::for_storage(engine.storage()).create(&checkpoint)?;

    let output = CheckpointLine::from(&checkpoint);
    let mut human = HumanOutput::new("Checkpoint created");
    human.push_summary("ID", checkpoint.id.to_string());
    human.push_summary("Project", checkpoint.project_id.clone());
    human.push_summary("Version", checkpoint.version.to_string());
    human.push_detail(path.display().to_string());
    emit_success(ctx.output(), "checkpoint create", &output, Some(&human))
}

pub fn run_list(ctx: &Context, all: bool, since: Option<&str>, limit: Option<usize>) -> Result<()> {
    let engine = ctx.open()?;
    let project_id = if all {
        None
    } else {
        Some(engine.store().active_project()?.id.clone())
    };
    let since = since
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw.trim())
                .map(|at| at.with_timezone(&Utc))
                .map_err(|err| Error::Validation(format!("invalid --since {raw}: {err}")))
        })
        .transpose()?;
    let filter = CheckpointFilter {
        project_id,
        owner_id: None,
        since,
    };
    let checkpoints = CheckpointStore::for_storage(engine.storage()).list(&filter, limit)?;

    let mut human = HumanOutput::new("Checkpoints");
    human.push_summary("Total", checkpoints.len().to_string());
    for checkpoint in &checkpoints {
        human.push_detail(checkpoint.summary());
    }
    let output = CheckpointListOutput {
        total: checkpoints.len(),
        checkpoints: checkpoints.iter().map(CheckpointLine::from).collect(),
    };
    emit_success(ctx.output(), "checkpoint list", &output, Some(&human))
}

pub async fn run_restore(ctx: &Context, id: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let checkpoint = CheckpointStore::for_storage(engine.storage()).get(parse_id(id)?)?;
    engine.restore_checkpoint(&checkpoint)?;
    if engine.store().active_project_id() != Some(checkpoint.project_id.as_str()) {
        engine.store_mut().select_project(&checkpoint.project_id)?;
    }
    ctx.save(&mut engine).await?;

    let output = CheckpointLine::from(&checkpoint);
    let mut human = HumanOutput::new("Checkpoint restored");
    human.push_summary("ID", checkpoint.id.to_string());
    human.push_summary("Project", checkpoint.project_id.clone());
    human.push_summary("Tasks", output.tasks.to_string());
    human.push_next_step("stagewise sync push");
    emit_success(ctx.output(), "checkpoint restore", &output, Some(&human))
}

pub fn run_rm(ctx: &Context, id: &str) -> Result<()> {
    let storage = ctx.storage();
    let id = parse_id(id)?;
    CheckpointStore::for_storage(&storage).delete(id)?;

    let mut human = HumanOutput::new("Checkpoint deleted");
    human.push_summary("ID", id.to_string());
    emit_success(ctx.output(), "checkpoint rm", &CheckpointRemoveOutput { id }, Some(&human))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|err| Error::Validation(format!("invalid checkpoint id {raw}: {err}")))
}
