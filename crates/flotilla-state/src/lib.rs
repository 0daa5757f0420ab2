//! Flotilla-State: persistence seams for the fleet orchestrator.
//!
//! This crate owns the two stores the orchestration engine writes through:
//!
//! - [`CheckpointStore`]: per-issue phase progress, gate verdicts, token
//!   records and terminal statuses, so an interrupted fleet run can resume
//!   best-effort.
//! - [`TokenTracker`]: the shared append-only token accumulator that budget
//!   enforcement classifies against.
//!
//! Backends: [`FsCheckpoint`] (one JSON document per run) for real runs and
//! [`fakes::MemoryCheckpoint`] for tests.

mod error;
pub mod checkpoint;
pub mod fakes;
mod fs;
mod tracker;

pub use checkpoint::{
    CheckpointStore, DagRecord, GateRecord, IssueCheckpoint, IssueStatus, PhaseCheckpoint,
    TokenRecord,
};
pub use error::{StorageError, StorageResult};
pub use fs::FsCheckpoint;
pub use tracker::{BudgetStatus, TokenTotals, TokenTracker, DEFAULT_WARNING_RATIO};
