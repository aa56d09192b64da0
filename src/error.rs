//! Error types for stagewise
//!
//! Every core mutation returns [`Result`]; expected failure modes are
//! variants here, never panics. `code()` yields the taxonomy kind surfaced to
//! callers (`LAYOUT_RANK_CONFLICT`, ...).
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, unknown task, invalid config)
//! - 3: Layout refused (rank conflict, cycle, no space, parent/child conflict)
//! - 4: Operation failed (io, remote, version mismatch)

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit codes for the stagewise CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const LAYOUT_REFUSED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Classification of a remote/network failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    Network,
    Business,
    Timeout,
    Unknown,
}

impl SyncErrorKind {
    /// Network-ish failures are worth another attempt; business rejections are not.
    pub fn is_retryable(self) -> bool {
        !matches!(self, SyncErrorKind::Business)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncErrorKind::Network => "network",
            SyncErrorKind::Business => "business",
            SyncErrorKind::Timeout => "timeout",
            SyncErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a remote store or a queue processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Network, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Business, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Timeout, message)
    }
}

/// Main error type for stagewise operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Layout refusals (exit code 3)
    #[error("Stage {stage} is being rebalanced; retry shortly")]
    RankConflict { stage: u32 },

    #[error("Moving {task_id} would create a cycle")]
    CycleDetected { task_id: String },

    #[error("No rank space left for {task_id} between its parent and children")]
    NoSpace { task_id: String },

    #[error("Parent/child conflict: {0}")]
    ParentChildConflict(String),

    // Operation failures (exit code 4)
    #[error("Version mismatch: history recorded v{expected}, document is at v{actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("Remote error: {0}")]
    Remote(#[from] SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    /// Taxonomy kind for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::InvalidConfig(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "DATA_NOT_FOUND",
            Error::RankConflict { .. } => "LAYOUT_RANK_CONFLICT",
            Error::CycleDetected { .. } => "LAYOUT_CYCLE_DETECTED",
            Error::NoSpace { .. } => "LAYOUT_NO_SPACE",
            Error::ParentChildConflict(_) => "LAYOUT_PARENT_CHILD_CONFLICT",
            Error::VersionMismatch { .. } => "VERSION_MISMATCH",
            Error::Remote(_) => "REMOTE_ERROR",
            Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => "OPERATION_FAILED",
        }
    }

    /// Whether the caller may simply try again later
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RankConflict { .. } | Error::LockFailed(_) => true,
            Error::Remote(err) => err.kind.is_retryable(),
            _ => false,
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::Validation(_) | Error::NotFound(_) | Error::InvalidConfig(_) => {
                exit_codes::USER_ERROR
            }

            // Layout refusals
            Error::RankConflict { .. }
            | Error::CycleDetected { .. }
            | Error::NoSpace { .. }
            | Error::ParentChildConflict(_) => exit_codes::LAYOUT_REFUSED,

            // Operation failures
            Error::VersionMismatch { .. }
            | Error::Remote(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured payload for JSON error output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::RankConflict { stage } => Some(serde_json::json!({ "stage": stage })),
            Error::CycleDetected { task_id } | Error::NoSpace { task_id } => {
                Some(serde_json::json!({ "task_id": task_id }))
            }
            Error::VersionMismatch { expected, actual } => {
                Some(serde_json::json!({ "expected": expected, "actual": actual }))
            }
            Error::Remote(err) => Some(serde_json::json!({ "kind": err.kind })),
            _ => None,
        }
    }
}

/// Result type alias for stagewise operations
pub type Result<T> = std::result::Result<T, Error>;
