//! stagewise project command implementations.

use chrono::{DateTime, Utc};

use super::Context;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::storage::Session;
use crate::sync::SyncReport;

#[derive(serde::Serialize)]
struct ProjectCreateOutput {
    id: String,
    name: String,
    queued: usize,
}

#[derive(serde::Serialize)]
struct ProjectSummary {
    id: String,
    name: String,
    version: u64,
    tasks: usize,
    active: bool,
    updated_at: DateTime<Utc>,
}

#[derive(serde::Serialize)]
struct ProjectListOutput {
    total: usize,
    projects: Vec<ProjectSummary>,
}

#[derive(serde::Serialize)]
struct ProjectUseOutput {
    id: String,
    name: String,
}

#[derive(serde::Serialize)]
struct ProjectRemoveOutput {
    id: String,
    name: String,
    sync: SyncReport,
}

pub async fn run_new(ctx: &Context, name: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = engine.store_mut().create_project(name)?;
    let report = ctx.save(&mut engine).await?;

    let output = ProjectCreateOutput {
        id: id.clone(),
        name: name.trim().to_string(),
        queued: report.enqueued,
    };
    let mut human = HumanOutput::new("Project created");
    human.push_summary("ID", id);
    human.push_summary("Name", output.name.clone());
    human.push_next_step("stagewise task add <title> --stage 1");
    emit_success(ctx.output(), "project new", &output, Some(&human))
}

pub fn run_list(ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;
    let store = engine.store();
    let active = store.active_project_id();
    let projects: Vec<ProjectSummary> = store
        .projects()
        .iter()
        .map(|project| ProjectSummary {
            id: project.id.clone(),
            name: project.name.clone(),
            version: project.version,
            tasks: project.active_tasks().count(),
            active: active == Some(project.id.as_str()),
            updated_at: project.updated_at,
        })
        .collect();
    let output = ProjectListOutput {
        total: projects.len(),
        projects,
    };

    let mut human = HumanOutput::new("Projects");
    human.push_summary("Total", output.total.to_string());
    for project in &output.projects {
        let marker = if project.active { "*" } else { " " };
        human.push_detail(format!(
            "{marker} {} {} (v{}, {} tasks)",
            project.id, project.name, project.version, project.tasks
        ));
    }
    emit_success(ctx.output(), "project list", &output, Some(&human))
}

pub fn run_use(ctx: &Context, id: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    engine.store_mut().select_project(id)?;
    engine.storage().save_session(&Session {
        active_project: Some(id.to_string()),
    })?;
    let project = engine.store().active_project()?;
    let output = ProjectUseOutput {
        id: project.id.clone(),
        name: project.name.clone(),
    };

    let mut human = HumanOutput::new("Active project switched");
    human.push_summary("ID", output.id.clone());
    human.push_summary("Name", output.name.clone());
    emit_success(ctx.output(), "project use", &output, Some(&human))
}

pub async fn run_rm(ctx: &Context, id: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let name = engine
        .store()
        .project(id)
        .map(|project| project.name.clone())
        .unwrap_or_default();
    let sync = engine.delete_project(id).await?;
    let output = ProjectRemoveOutput {
        id: id.to_string(),
        name,
        sync,
    };

    let mut human = HumanOutput::new("Project deleted");
    human.push_summary("ID", output.id.clone());
    human.push_summary("Queued remote delete", output.sync.queue.remaining.to_string());
    human.push_next_step("stagewise sync push");
    emit_success(ctx.output(), "project rm", &output, Some(&human))
}
