//! stagewise init command implementation
//!
//! Creates `.stagewise.toml` and the `.stagewise/` state directory.

use std::path::{Path, PathBuf};

use super::Context;
use crate::config::{Config, CONFIG_FILE};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::storage::{ensure_gitignore, STATE_DIR};

#[derive(serde::Serialize)]
struct InitReport {
    dir: PathBuf,
    created: InitCreated,
    updated: InitUpdated,
}

#[derive(serde::Serialize)]
struct InitCreated {
    config: bool,
    state_dir: bool,
}

#[derive(serde::Serialize)]
struct InitUpdated {
    gitignore: bool,
}

pub fn run(ctx: &Context) -> Result<()> {
    std::fs::create_dir_all(&ctx.dir)?;
    let storage = ctx.storage();

    let created_state_dir = !storage.is_initialized();
    storage.init()?;
    let created_config = ensure_config(&ctx.dir)?;
    let updated_gitignore = update_gitignore(&ctx.dir)?;

    let report = InitReport {
        dir: ctx.dir.clone(),
        created: InitCreated {
            config: created_config,
            state_dir: created_state_dir,
        },
        updated: InitUpdated {
            gitignore: updated_gitignore,
        },
    };

    let mut created_items = Vec::new();
    if created_config {
        created_items.push(CONFIG_FILE.to_string());
    }
    if created_state_dir {
        created_items.push(format!("{STATE_DIR}/"));
    }

    let header = if created_items.is_empty() && !updated_gitignore {
        "stagewise init: nothing to do"
    } else {
        "stagewise init: planner ready"
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("dir", ctx.dir.display().to_string());
    human.push_summary(
        "created",
        if created_items.is_empty() {
            "none".to_string()
        } else {
            created_items.join(", ")
        },
    );
    if updated_gitignore {
        human.push_summary("updated", ".gitignore");
    }
    human.push_next_step("stagewise project new <name>");

    emit_success(ctx.output(), "init", &report, Some(&human))
}

fn ensure_config(dir: &Path) -> Result<bool> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        return Ok(false);
    }
    Config::default().save(&path)?;
    Ok(true)
}

fn update_gitignore(dir: &Path) -> Result<bool> {
    let path = dir.join(".gitignore");
    let before = std::fs::read_to_string(&path).unwrap_or_default();
    ensure_gitignore(dir)?;
    let after = std::fs::read_to_string(&path).unwrap_or_default();
    Ok(before != after)
}
