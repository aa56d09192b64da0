//! stagewise queue command implementations.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Context;
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::queue::{ActionPriority, QueuedAction};
use crate::sync::SyncReport;

#[derive(serde::Serialize)]
struct ActionLine {
    id: Uuid,
    key: String,
    entity_id: String,
    priority: ActionPriority,
    retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(serde::Serialize)]
struct DeadLetterLine {
    action: ActionLine,
    failed_at: DateTime<Utc>,
    reason: String,
}

#[derive(serde::Serialize)]
struct QueueListOutput {
    paused: bool,
    actions: Vec<ActionLine>,
    dead_letters: Vec<DeadLetterLine>,
}

#[derive(serde::Serialize)]
struct DeadLetterChangeOutput {
    id: Uuid,
    queued: usize,
    dead_letters: usize,
}

pub fn run_list(ctx: &Context) -> Result<()> {
    let engine = ctx.open()?;
    let queue = engine.queue();
    let output = QueueListOutput {
        paused: queue.is_paused(),
        actions: queue.actions().map(action_line).collect(),
        dead_letters: queue
            .dead_letters()
            .map(|item| DeadLetterLine {
                action: action_line(&item.action),
                failed_at: item.failed_at,
                reason: item.reason.clone(),
            })
            .collect(),
    };

    let mut human = HumanOutput::new("Offline queue");
    human.push_summary("Pending", output.actions.len().to_string());
    human.push_summary("Dead letters", output.dead_letters.len().to_string());
    for action in &output.actions {
        let mut line = format!("{} {} {}", action.id, action.key, action.entity_id);
        if action.retry_count > 0 {
            line.push_str(&format!(" (retry {})", action.retry_count));
        }
        human.push_detail(line);
    }
    for item in &output.dead_letters {
        human.push_warning(format!(
            "{} {} {}: {}",
            item.action.id, item.action.key, item.action.entity_id, item.reason
        ));
    }
    if !output.actions.is_empty() {
        human.push_next_step("stagewise sync push");
    }
    emit_success(ctx.output(), "queue list", &output, Some(&human))
}

pub async fn run_process(ctx: &Context) -> Result<()> {
    let mut engine = ctx.open()?;
    engine.set_online(true);
    let report: SyncReport = engine.process().await?;

    let mut human = HumanOutput::new("Queue processed");
    human.push_summary("Sent", report.queue.processed.to_string());
    human.push_summary("Retrying", report.queue.retried.to_string());
    human.push_summary("Dead-lettered", report.queue.dead_lettered.to_string());
    human.push_summary("Remaining", report.queue.remaining.to_string());
    if report.conflicts > 0 {
        human.push_warning("remote rejected a push with conflicting edits");
        human.push_next_step("stagewise sync resolve <local|remote|merge>");
    }
    emit_success(ctx.output(), "queue process", &report, Some(&human))
}

pub fn run_retry(ctx: &Context, id: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = parse_id(id)?;
    engine.retry_dead_letter(id)?;
    dead_letter_changed(ctx, &engine, id, "Dead letter requeued", "queue retry")
}

pub fn run_dismiss(ctx: &Context, id: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    let id = parse_id(id)?;
    engine.dismiss_dead_letter(id)?;
    dead_letter_changed(ctx, &engine, id, "Dead letter dismissed", "queue dismiss")
}

fn dead_letter_changed(
    ctx: &Context,
    engine: &crate::sync::SyncEngine,
    id: Uuid,
    header: &str,
    command: &str,
) -> Result<()> {
    let output = DeadLetterChangeOutput {
        id,
        queued: engine.queue().len(),
        dead_letters: engine.queue().dead_letters().count(),
    };
    let mut human = HumanOutput::new(header);
    human.push_summary("ID", id.to_string());
    human.push_summary("Pending", output.queued.to_string());
    emit_success(ctx.output(), command, &output, Some(&human))
}

fn action_line(action: &QueuedAction) -> ActionLine {
    ActionLine {
        id: action.id,
        key: action.processor_key(),
        entity_id: action.entity_id.clone(),
        priority: action.priority,
        retry_count: action.retry_count,
        last_error: action.last_error.clone(),
        next_attempt_at: action.next_attempt_at,
    }
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|err| Error::Validation(format!("invalid action id {raw}: {err}")))
}
