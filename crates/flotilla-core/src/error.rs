//! Error taxonomy for the orchestration engine.
//!
//! The typed variants here are the ones callers branch on; budget and
//! cycle errors in particular must stay matchable and never be flattened
//! into strings. Everything else an item's pipeline can fail with is
//! captured as a structured result record (`PhaseResult::error`,
//! `ItemReport::error`) rather than thrown, so one item's failure never
//! aborts its siblings.

use thiserror::Error;

/// Errors produced by the fleet orchestration engine.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The dependency mapping contains a cycle; names the items that could
    /// never be placed into a wave.
    #[error("cyclic dependency detected involving issues: {items:?}")]
    CyclicDependency { items: Vec<u64> },

    /// The dependency resolver exhausted its attempts without a usable
    /// mapping.
    #[error("dependency resolution failed: {reason}")]
    DependencyResolution { reason: String },

    /// An issue crossed its token budget. Sticky per item: once raised, the
    /// item's remaining phases are aborted, the fleet is unaffected.
    #[error("issue #{issue} exceeded its token budget ({used}/{budget} tokens)")]
    BudgetExceeded { issue: u64, used: u64, budget: u64 },

    /// The agent launcher itself failed (transport-level, not an agent that
    /// ran and produced a bad result).
    #[error("agent launch failed: {reason}")]
    Agent { reason: String },

    /// Bubbled-up persistence error.
    #[error("storage error: {0}")]
    Storage(#[from] flotilla_state::StorageError),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, FleetError>;
