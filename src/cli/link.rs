//! stagewise link command implementations.

use super::Context;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

#[derive(serde::Serialize)]
struct LinkOutput {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    structural: Option<bool>,
}

pub async fn run_add(ctx: &Context, source: &str, target: &str, description: Option<String>) -> Result<()> {
    let mut engine = ctx.open()?;
    let source = engine.store().resolve_task_id(source)?;
    let target = engine.store().resolve_task_id(target)?;
    let id = engine.store_mut().add_connection(&source, &target, description)?;
    ctx.save(&mut engine).await?;

    let project = engine.store().active_project()?;
    let structural = project
        .connections
        .iter()
        .find(|connection| connection.id == id)
        .map(|connection| connection.is_structural(project));
    let label = |task_id: &str| {
        project
            .task(task_id)
            .map(|task| task.display_id.clone())
            .unwrap_or_else(|| task_id.to_string())
    };

    let mut human = HumanOutput::new("Tasks connected");
    human.push_summary("ID", id.clone());
    human.push_summary("From", label(&source));
    human.push_summary("To", label(&target));
    if structural == Some(true) {
        human.push_detail("connection follows the parent/child tree");
    }
    let output = LinkOutput {
        id,
        source: Some(source),
        target: Some(target),
        structural,
    };
    emit_success(ctx.output(), "link add", &output, Some(&human))
}

pub async fn run_rm(ctx: &Context, id: &str) -> Result<()> {
    let mut engine = ctx.open()?;
    engine.store_mut().remove_connection(id)?;
    ctx.save(&mut engine).await?;

    let output = LinkOutput {
        id: id.to_string(),
        source: None,
        target: None,
        structural: None,
    };
    let mut human = HumanOutput::new("Connection removed");
    human.push_summary("ID", id.to_string());
    emit_success(ctx.output(), "link rm", &output, Some(&human))
}
