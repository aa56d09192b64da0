//! stagewise sync command implementations.

use super::Context;
use crate::conflict::{PendingConflict, Resolution};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::sync::{ReconnectReport, SyncReport};

#[derive(serde::Serialize)]
struct ConflictSummary {
    project_id: String,
    local_version: u64,
    remote_version: u64,
    conflict_count: usize,
    entities: Vec<String>,
}

#[derive(serde::Serialize)]
struct PushOutput {
    #[serde(flatten)]
    report: SyncReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict: Option<ConflictSummary>,
}

#[derive(serde::Serialize)]
struct PullOutput {
    #[serde(flatten)]
    report: ReconnectReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict: Option<ConflictSummary>,
}

#[derive(serde::Serialize)]
struct ResolveOutput {
    project_id: String,
    choice: Resolution,
    version: u64,
    sync: SyncReport,
}

pub async fn run_push(ctx: &Context) -> Result<()> {
    let mut engine = ctx.open()?;
    engine.set_online(true);
    engine.store_mut().settle();
    let report = engine.flush().await?;
    let conflict = engine.pending_conflict().map(summarize);

    let mut human = HumanOutput::new("Pushed local changes");
    push_sync_summary(&mut human, &report);
    if let Some(conflict) = &conflict {
        push_conflict(&mut human, conflict);
    }
    emit_success(ctx.output(), "sync push", &PushOutput { report, conflict }, Some(&human))
}

pub async fn run_pull(ctx: &Context) -> Result<()> {
    let mut engine = ctx.open()?;
    engine.store_mut().settle();
    let report = engine.reconnect().await?;
    let conflict = engine.pending_conflict().map(summarize);

    let mut human = HumanOutput::new("Pulled remote projects");
    human.push_summary("Pulled", report.pulled.to_string());
    human.push_summary("Adopted", report.adopted.to_string());
    human.push_summary("Merged", report.merged.to_string());
    push_sync_summary(&mut human, &report.sync);
    if let Some(conflict) = &conflict {
        push_conflict(&mut human, conflict);
    }
    emit_success(ctx.output(), "sync pull", &PullOutput { report, conflict }, Some(&human))
}

pub async fn run_resolve(ctx: &Context, choice: &str) -> Result<()> {
    let choice = Resolution::parse(choice)
        .ok_or_else(|| Error::Validation(format!("unknown resolution {choice}; use local, remote or merge")))?;
    let mut engine = ctx.open()?;
    engine.set_online(true);
    let project_id = engine
        .pending_conflict()
        .map(|pending| pending.project_id.clone())
        .ok_or_else(|| Error::NotFound("no pending conflict".to_string()))?;
    let sync = engine.resolve_conflict(choice).await?;
    let version = engine
        .store()
        .project(&project_id)
        .map(|project| project.version)
        .unwrap_or_default();

    let mut human = HumanOutput::new(format!("Conflict resolved ({choice})"));
    human.push_summary("Project", project_id.clone());
    human.push_summary("Version", version.to_string());
    push_sync_summary(&mut human, &sync);
    let output = ResolveOutput {
        project_id,
        choice,
        version,
        sync,
    };
    emit_success(ctx.output(), "sync resolve", &output, Some(&human))
}

fn summarize(pending: &PendingConflict) -> ConflictSummary {
    ConflictSummary {
        project_id: pending.project_id.clone(),
        local_version: pending.local.version,
        remote_version: pending.remote.version,
        conflict_count: pending.conflict_count(),
        entities: pending
            .merged
            .conflicts
            .iter()
            .map(|conflict| conflict.id.clone())
            .collect(),
    }
}

fn push_sync_summary(human: &mut HumanOutput, report: &SyncReport) {
    human.push_summary("Acknowledged", report.acked.to_string());
    human.push_summary("Remaining", report.queue.remaining.to_string());
    if report.queue.dead_lettered > 0 {
        human.push_warning(format!("{} action(s) dead-lettered", report.queue.dead_lettered));
        human.push_next_step("stagewise queue list");
    }
}

fn push_conflict(human: &mut HumanOutput, conflict: &ConflictSummary) {
    human.push_warning(format!(
        "project {} has {} conflicting edit(s): local v{} vs remote v{}",
        conflict.project_id, conflict.conflict_count, conflict.local_version, conflict.remote_version
    ));
    human.push_next_step("stagewise sync resolve <local|remote|merge>");
}
