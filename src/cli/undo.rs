//! stagewise undo/redo command implementation.

use super::Context;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

#[derive(serde::Serialize)]
struct HistoryStepOutput {
    project_id: String,
    label: String,
    can_undo: bool,
    can_redo: bool,
}

pub async fn run(ctx: &Context, backwards: bool) -> Result<()> {
    let mut engine = ctx.open()?;
    let label = if backwards {
        engine.store_mut().undo()?
    } else {
        engine.store_mut().redo()?
    };
    ctx.save(&mut engine).await?;

    let project_id = engine.store().active_project()?.id.clone();
    let history = engine.store().history(&project_id);
    let output = HistoryStepOutput {
        project_id,
        label: label.clone(),
        can_undo: history.map(|h| h.can_undo()).unwrap_or(false),
        can_redo: history.map(|h| h.can_redo()).unwrap_or(false),
    };

    let mut human = HumanOutput::new(label);
    if let Some(history) = history {
        human.push_summary("Undo steps", history.undo_len().to_string());
        human.push_summary("Redo steps", history.redo_len().to_string());
    }
    let command = if backwards { "undo" } else { "redo" };
    emit_success(ctx.output(), command, &output, Some(&human))
}
