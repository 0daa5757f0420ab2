//! Flotilla-Core: the issue-fleet orchestration engine.
//!
//! A fleet run takes a set of work items (issues), infers or accepts a
//! dependency graph between them, and drives each item through a fixed
//! five-phase agent pipeline (analysis, planning, implementation,
//! integration-verification, delivery) under a per-item token budget.
//! Finished items enqueue their pull requests on an asynchronous
//! completion queue that merges them in dependency order.
//!
//! The engine is transport-agnostic: agent processes, the PR platform,
//! notifications and progress logs all sit behind the traits in
//! [`traits`], with in-memory fakes in [`fakes`] for testing. The CLI
//! crate provides the real adapters.

pub mod budget;
pub mod dag;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod merge_queue;
pub mod model;
pub mod phase;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod telemetry;
pub mod traits;

pub use budget::IssueBudgetGuard;
pub use dag::IssueDag;
pub use error::{FleetError, Result};
pub use gate::GateCoordinator;
pub use merge_queue::{CompletionOutcome, PullRequestCompletionQueue, QueueConfig};
pub use model::{
    GateResult, GateStatus, Notification, NotificationScope, Phase, PhaseResult, QueueItem,
    WorkItem,
};
pub use phase::PhaseRunner;
pub use report::{render_fleet_summary, FleetSummary, ItemSummary};
pub use resolver::{DependencyResolver, RepoContext};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
pub use scheduler::{
    BlockedMarker, FleetScheduler, ItemOutcome, ItemReport, DEPENDENCY_FAILURE_STATUSES,
};
