//! stagewise - Hierarchical Stage Planner Library
//!
//! Core of a task planner where tasks sit in numbered stages and children
//! always live in a later stage than their parent. The library keeps the
//! documents ordered and consistent, and syncs them with a remote while
//! tolerating long offline periods.
//!
//! # Core Concepts
//!
//! - **Ranks**: Fractional ordering keys with a fixed span per stage
//! - **Rebalance**: One pass that normalizes links, rejects cycles and
//!   reassigns ranks, positions and display ids (`1`, `1,a`, `1,a,b`)
//! - **History**: Per-project undo/redo tied to document versions
//! - **Offline Queue**: Prioritized, retried, dead-lettered remote actions
//! - **Merge**: Additive entity merge with a user decision on divergence
//!
//! # Module Organization
//!
//! - `cli`: Command-line interface using clap
//! - `config`: Configuration loading from `.stagewise.toml`
//! - `error`: Error types and result aliases
//! - `model`: Projects, tasks and connections
//! - `rank`: Rank allocation and the refusal strategy
//! - `layout`: Tree rebalance and cycle detection
//! - `sanitize`: Repairs applied to documents loaded from disk or remote
//! - `coordinator`: Debounced per-stage rank re-spreading
//! - `history`: Versioned mutation log for undo/redo
//! - `store`: In-memory document store and its mutations
//! - `queue`: Offline action queue
//! - `conflict`: Project merge and conflict resolution
//! - `remote`: Remote store trait with in-memory and directory backends
//! - `sync`: Sync engine tying store, queue and remote together
//! - `checkpoint`: Saved project snapshots
//! - `timer`: Clock and keyed deadlines
//! - `storage`: Local cache files under `.stagewise/`
//! - `lock`: File locking and atomic operations for concurrency safety
//! - `output`: Human and JSON command output

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod layout;
pub mod lock;
pub mod model;
pub mod output;
pub mod queue;
pub mod rank;
pub mod remote;
pub mod sanitize;
pub mod storage;
pub mod store;
pub mod sync;
pub mod timer;

pub use error::{Error, Result};
