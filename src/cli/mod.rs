//! Command-line interface for stagewise
//!
//! This module defines the CLI structure using clap derive macros.
//! Each command group is defined in its own submodule.

use std::path::PathBuf;
use std::rc::Rc;

use clap::{Parser, Subcommand};

use crate::config::{Config, CONFIG_FILE};
use crate::error::{Error, Result};
use crate::output::OutputOptions;
use crate::remote::DirRemoteStore;
use crate::storage::Storage;
use crate::sync::{SyncEngine, SyncReport};
use crate::timer::SystemClock;

mod checkpoint;
mod init;
mod link;
mod project;
mod queue;
mod sync;
mod task;
mod undo;

/// stagewise - hierarchical stage planner
///
/// Tasks live in numbered stages; children always sit in a later stage than
/// their parent. Edits are stored locally and pushed to a shared remote
/// directory with `stagewise sync push`.
#[derive(Parser, Debug)]
#[command(name = "stagewise")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Planner directory (defaults to current directory)
    #[arg(long, global = true, env = "STAGEWISE_DIR")]
    pub dir: Option<PathBuf>,

    /// Remote directory shared between planners (defaults to .stagewise/remote)
    #[arg(long, global = true, env = "STAGEWISE_REMOTE")]
    pub remote: Option<PathBuf>,

    /// Owner id used for remote saves (overrides [owner] in .stagewise.toml)
    #[arg(long, global = true, env = "STAGEWISE_OWNER")]
    pub owner: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a planner directory
    Init,

    /// Project management
    #[command(subcommand)]
    Project(ProjectCommands),

    /// Task editing
    #[command(subcommand)]
    Task(TaskCommands),

    /// Connections between tasks
    #[command(subcommand)]
    Link(LinkCommands),

    /// Undo the last change to the active project
    Undo,

    /// Redo the last undone change
    Redo,

    /// Offline action queue
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Exchange changes with the remote
    #[command(subcommand)]
    Sync(SyncCommands),

    /// Project checkpoints
    #[command(subcommand)]
    Checkpoint(CheckpointCommands),
}

/// Project subcommands
#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Create a project and make it active
    New {
        /// Project name
        name: String,
    },

    /// List local projects
    List,

    /// Switch the active project
    Use {
        /// Project id
        id: String,
    },

    /// Delete a project locally and on the remote
    Rm {
        /// Project id
        id: String,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Add a task to the active project
    Add {
        /// Task title
        title: String,

        /// Stage number (defaults to the stage after --parent)
        #[arg(long)]
        stage: Option<u32>,

        /// Parent task (id, short id or display id)
        #[arg(long)]
        parent: Option<String>,

        /// Insert right after --parent as its sibling instead of as a child
        #[arg(long, requires = "parent")]
        sibling: bool,

        /// Task body
        #[arg(long, default_value = "")]
        content: String,
    },

    /// Move a task (and its subtree) to another stage
    Move {
        /// Task to move
        task: String,

        /// Target stage; omit to unassign
        #[arg(long)]
        stage: Option<u32>,

        /// Place before this task of the target stage
        #[arg(long)]
        before: Option<String>,

        /// New parent
        #[arg(long)]
        parent: Option<String>,
    },

    /// Detach a task from its parent
    Detach {
        /// Task to detach
        task: String,
    },

    /// Set the order of a stage's root tasks
    Reorder {
        /// Stage number
        stage: u32,

        /// Tasks in the wanted order
        #[arg(required = true)]
        tasks: Vec<String>,
    },

    /// Edit a task
    Edit {
        /// Task to edit
        task: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        content: Option<String>,

        /// active, completed or archived
        #[arg(long)]
        status: Option<String>,

        /// low, medium, high, urgent or "none"
        #[arg(long)]
        priority: Option<String>,

        /// RFC 3339 timestamp or "none"
        #[arg(long)]
        due: Option<String>,

        /// Replace tags (repeatable)
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
    },

    /// Soft-delete a task and its subtree
    Delete {
        task: String,
    },

    /// Restore a soft-deleted task
    Restore {
        task: String,
    },

    /// Permanently remove a task, its subtree and its connections
    Purge {
        task: String,
    },

    /// List tasks of the active project by stage
    List {
        /// Include soft-deleted tasks
        #[arg(long)]
        deleted: bool,
    },
}

/// Connection subcommands
#[derive(Subcommand, Debug)]
pub enum LinkCommands {
    /// Connect two tasks
    Add {
        source: String,
        target: String,

        #[arg(long)]
        description: Option<String>,
    },

    /// Remove a connection
    Rm {
        /// Connection id
        id: String,
    },
}

/// Queue subcommands
#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Show pending actions and dead letters
    List,

    /// Try to send pending actions now
    Process,

    /// Move a dead letter back into the queue
    Retry {
        /// Dead letter id
        id: String,
    },

    /// Drop a dead letter
    Dismiss {
        /// Dead letter id
        id: String,
    },
}

/// Sync subcommands
#[derive(Subcommand, Debug)]
pub enum SyncCommands {
    /// Send local changes to the remote
    Push,

    /// Pull remote projects, merge, then push
    Pull,

    /// Resolve a pending conflict: local, remote or merge
    Resolve {
        choice: String,
    },
}

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// Save the active project
    Create {
        #[arg(long)]
        label: Option<String>,
    },

    /// List checkpoints of the active project
    List {
        /// Include every project
        #[arg(long)]
        all: bool,

        /// Only checkpoints created at or after this RFC 3339 time
        #[arg(long)]
        since: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Replace the project with a checkpoint
    Restore {
        id: String,
    },

    /// Delete a checkpoint
    Rm {
        id: String,
    },
}

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    pub dir: PathBuf,
    pub remote: Option<PathBuf>,
    pub owner: Option<String>,
    pub json: bool,
    pub quiet: bool,
}

impl Context {
    pub fn output(&self) -> OutputOptions {
        OutputOptions {
            json: self.json,
            quiet: self.quiet,
        }
    }

    pub fn storage(&self) -> Storage {
        Storage::for_dir(self.dir.clone())
    }

    /// `.stagewise.toml` when present, defaults otherwise. An invalid file
    /// is an error here, not a silent fallback.
    pub fn config(&self) -> Result<Config> {
        let path = self.dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            Config::load(&path)?
        } else {
            Config::default()
        };
        if let Some(owner) = &self.owner {
            config.owner.id = owner.clone();
        }
        Ok(config)
    }

    /// Open the planner offline. Commands go online explicitly.
    pub fn open(&self) -> Result<SyncEngine> {
        let storage = self.storage();
        if !storage.is_initialized() {
            return Err(Error::NotFound(format!(
                "planner directory {} (run `stagewise init`)",
                self.dir.display()
            )));
        }
        let remote_dir = self.remote.clone().unwrap_or_else(|| storage.remote_dir());
        let (mut engine, report) = SyncEngine::open(
            storage,
            self.config()?,
            Rc::new(SystemClock),
            Rc::new(DirRemoteStore::new(remote_dir)),
        )?;
        for repair in &report.repairs {
            tracing::info!(repair = %repair, "cache repaired on load");
        }
        for rejected in &report.rejected {
            tracing::warn!(project = %rejected, "cached project could not be loaded");
        }
        engine.set_online(false);
        Ok(engine)
    }

    /// Finish pending stage work and queue the result for the next push.
    pub async fn save(&self, engine: &mut SyncEngine) -> Result<SyncReport> {
        engine.store_mut().settle();
        engine.flush().await
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.dispatch())
    }

    async fn dispatch(self) -> Result<()> {
        let dir = match self.dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let ctx = Context {
            dir,
            remote: self.remote,
            owner: self.owner,
            json: self.json,
            quiet: self.quiet,
        };

        match self.command {
            Commands::Init => init::run(&ctx),
            Commands::Project(cmd) => match cmd {
                ProjectCommands::New { name } => project::run_new(&ctx, &name).await,
                ProjectCommands::List => project::run_list(&ctx),
                ProjectCommands::Use { id } => project::run_use(&ctx, &id),
                ProjectCommands::Rm { id } => project::run_rm(&ctx, &id).await,
            },
            Commands::Task(cmd) => match cmd {
                TaskCommands::Add { title, stage, parent, sibling, content } => {
                    task::run_add(
                        &ctx,
                        task::AddOptions {
                            title,
                            stage,
                            parent,
                            sibling,
                            content,
                        },
                    )
                    .await
                }
                TaskCommands::Move { task, stage, before, parent } => {
                    task::run_move(
                        &ctx,
                        task::MoveOptions {
                            task,
                            stage,
                            before,
                            parent,
                        },
                    )
                    .await
                }
                TaskCommands::Detach { task } => task::run_detach(&ctx, &task).await,
                TaskCommands::Reorder { stage, tasks } => task::run_reorder(&ctx, stage, &tasks).await,
                TaskCommands::Edit { task, title, content, status, priority, due, tags } => {
                    task::run_edit(
                        &ctx,
                        task::EditOptions {
                            task,
                            title,
                            content,
                            status,
                            priority,
                            due,
                            tags,
                        },
                    )
                    .await
                }
                TaskCommands::Delete { task } => task::run_delete(&ctx, &task).await,
                TaskCommands::Restore { task } => task::run_restore(&ctx, &task).await,
                TaskCommands::Purge { task } => task::run_purge(&ctx, &task).await,
                TaskCommands::List { deleted } => task::run_list(&ctx, deleted),
            },
            Commands::Link(cmd) => match cmd {
                LinkCommands::Add { source, target, description } => {
                    link::run_add(&ctx, &source, &target, description).await
                }
                LinkCommands::Rm { id } => link::run_rm(&ctx, &id).await,
            },
            Commands::Undo => undo::run(&ctx, true).await,
            Commands::Redo => undo::run(&ctx, false).await,
            Commands::Queue(cmd) => match cmd {
                QueueCommands::List => queue::run_list(&ctx),
                QueueCommands::Process => queue::run_process(&ctx).await,
                QueueCommands::Retry { id } => queue::run_retry(&ctx, &id),
                QueueCommands::Dismiss { id } => queue::run_dismiss(&ctx, &id),
            },
            Commands::Sync(cmd) => match cmd {
                SyncCommands::Push => sync::run_push(&ctx).await,
                SyncCommands::Pull => sync::run_pull(&ctx).await,
                SyncCommands::Resolve { choice } => sync::run_resolve(&ctx, &choice).await,
            },
            Commands::Checkpoint(cmd) => match cmd {
                CheckpointCommands::Create { label } => checkpoint::run_create(&ctx, label),
                CheckpointCommands::List { all, since, limit } => {
                    checkpoint::run_list(&ctx, all, since.as_deref(), limit)
                }
                CheckpointCommands::Restore { id } => checkpoint::run_restore(&ctx, &id).await,
                CheckpointCommands::Rm { id } => checkpoint::run_rm(&ctx, &id),
            },
        }
    }
}
