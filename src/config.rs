//! Configuration loading and management
//!
//! Handles parsing of `.stagewise.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Name of the configuration file in a planner directory
pub const CONFIG_FILE: &str = ".stagewise.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Owner configuration
    #[serde(default)]
    pub owner: OwnerConfig,

    /// Rank and tree layout configuration
    #[serde(default)]
    pub layout: LayoutConfig,

    /// Persistence and remote sync timing
    #[serde(default)]
    pub sync: SyncConfig,

    /// Offline action queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Undo/redo history configuration
    #[serde(default)]
    pub history: HistoryConfig,
}

/// Owner identity used for remote writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerConfig {
    /// Owner id sent with every remote save
    #[serde(default = "default_owner")]
    pub id: String,
}

fn default_owner() -> String {
    "local".to_string()
}

impl Default for OwnerConfig {
    fn default() -> Self {
        Self {
            id: default_owner(),
        }
    }
}

/// Rank allocation and layout constants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayoutConfig {
    /// Gap used for head/tail inserts and clamps
    #[serde(default = "default_rank_step")]
    pub rank_step: f64,

    /// Rank span reserved per stage (`stage_base = stage * span`)
    #[serde(default = "default_stage_rank_span")]
    pub stage_rank_span: f64,

    /// Neighbor gap below which a stage rebalance is scheduled
    #[serde(default = "default_min_rank_gap")]
    pub min_rank_gap: f64,

    /// Depth guard for tree traversals
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Grid column width for position defaults
    #[serde(default = "default_grid_column_width")]
    pub grid_column_width: f64,

    /// Grid row height for position defaults
    #[serde(default = "default_grid_row_height")]
    pub grid_row_height: f64,

    /// Debounce before a requested stage rebalance runs
    #[serde(default = "default_rebalance_debounce_ms")]
    pub rebalance_debounce_ms: u64,
}

fn default_rank_step() -> f64 {
    500.0
}

fn default_stage_rank_span() -> f64 {
    10_000.0
}

fn default_min_rank_gap() -> f64 {
    50.0
}

fn default_max_depth() -> usize {
    100
}

fn default_grid_column_width() -> f64 {
    320.0
}

fn default_grid_row_height() -> f64 {
    120.0
}

fn default_rebalance_debounce_ms() -> u64 {
    100
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            rank_step: default_rank_step(),
            stage_rank_span: default_stage_rank_span(),
            min_rank_gap: default_min_rank_gap(),
            max_depth: default_max_depth(),
            grid_column_width: default_grid_column_width(),
            grid_row_height: default_grid_row_height(),
            rebalance_debounce_ms: default_rebalance_debounce_ms(),
        }
    }
}

/// Persistence and sync timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Coalesce bursts of edits into one write
    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Suppress remote-triggered reloads this long after a local write
    #[serde(default = "default_recently_persisted_ms")]
    pub recently_persisted_ms: u64,

    /// How long the editing flag stays up after the last keystroke
    #[serde(default = "default_editing_timeout_ms")]
    pub editing_timeout_ms: u64,
}

fn default_persist_debounce_ms() -> u64 {
    800
}

fn default_recently_persisted_ms() -> u64 {
    2000
}

fn default_editing_timeout_ms() -> u64 {
    1500
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            persist_debounce_ms: default_persist_debounce_ms(),
            recently_persisted_ms: default_recently_persisted_ms(),
            editing_timeout_ms: default_editing_timeout_ms(),
        }
    }
}

/// Offline queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retry attempts before an action is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Maximum queued actions
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Maximum dead-letter entries kept
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_queue_capacity() -> usize {
    500
}

fn default_dead_letter_capacity() -> usize {
    100
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            capacity: default_queue_capacity(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

/// Undo history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum undo entries
    #[serde(default = "default_history_depth")]
    pub max_depth: usize,

    /// Content edits closer together than this merge into one entry
    #[serde(default = "default_content_coalesce_ms")]
    pub content_coalesce_ms: u64,
}

fn default_history_depth() -> usize {
    100
}

fn default_content_coalesce_ms() -> u64 {
    1000
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_history_depth(),
            content_coalesce_ms: default_content_coalesce_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a `.stagewise.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a planner directory, or return defaults
    pub fn load_from_dir(dir: &Path) -> Self {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            match Self::load(&config_path) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring invalid config");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.owner.id.trim().is_empty() {
            return Err(Error::InvalidConfig("owner.id cannot be empty".to_string()));
        }
        self.layout.validate()?;
        self.queue.validate()?;
        if self.history.max_depth == 0 {
            return Err(Error::InvalidConfig(
                "history.max_depth must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl LayoutConfig {
    fn validate(&self) -> Result<()> {
        if !self.rank_step.is_finite() || self.rank_step <= 0.0 {
            return Err(Error::InvalidConfig(
                "layout.rank_step must be a positive number".to_string(),
            ));
        }
        if self.min_rank_gap.is_nan()
            || self.min_rank_gap <= 0.0
            || self.min_rank_gap >= self.rank_step
        {
            return Err(Error::InvalidConfig(
                "layout.min_rank_gap must be > 0 and < layout.rank_step".to_string(),
            ));
        }
        if self.stage_rank_span < self.rank_step {
            return Err(Error::InvalidConfig(
                "layout.stage_rank_span must be >= layout.rank_step".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(Error::InvalidConfig(
                "layout.max_depth must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue.capacity must be > 0".to_string(),
            ));
        }
        if self.dead_letter_capacity == 0 {
            return Err(Error::InvalidConfig(
                "queue.dead_letter_capacity must be > 0".to_string(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(
                "queue.backoff_base_ms must be <= queue.backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}
