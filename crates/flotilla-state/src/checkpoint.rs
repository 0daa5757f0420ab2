//! Checkpoint trait definitions for flotilla.
//!
//! The [`CheckpointStore`] trait is the single persistence seam the
//! orchestration engine writes through: phase progress, gate verdicts,
//! token usage and terminal issue statuses. It is treated as an
//! append-only record log safe for concurrent writers; multiple in-flight
//! issues append in any interleaving.
//!
//! All methods are async and backend-agnostic. An in-memory fake is
//! provided for testing via the `fakes` module; a JSON-file-backed
//! implementation lives in the `fs` module.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// Terminal and transitional statuses recorded per issue.
///
/// The `dep-*` statuses mark an issue whose fate was decided by a
/// dependency rather than by its own pipeline; the scheduler treats them
/// as failures regardless of what the pipeline reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    InProgress,
    Completed,
    Failed,
    DepFailed,
    DepBlocked,
    DepMergeConflict,
}

/// Persisted gate verdict for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    /// "pass", "warn" or "fail".
    pub status: String,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// One appended token-usage entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Which collaborator spent the tokens (e.g. "agent", "gate").
    pub source: String,
    /// Phase number the spend is attributed to.
    pub phase: u32,
    pub tokens: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Per-phase checkpoint entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhaseCheckpoint {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifact: Option<PathBuf>,
    pub gate: Option<GateRecord>,
}

/// Full checkpoint record for one issue.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IssueCheckpoint {
    pub status: Option<IssueStatus>,
    /// Keyed by phase number; a retried phase overwrites its entry.
    pub phases: HashMap<u32, PhaseCheckpoint>,
    pub tokens: Vec<TokenRecord>,
}

impl IssueCheckpoint {
    /// Total tokens recorded for this issue across all phases.
    pub fn total_tokens(&self) -> u64 {
        self.tokens.iter().map(|t| t.tokens).sum()
    }
}

/// Dependency-graph metadata recorded once per run, for reporting only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagRecord {
    pub edges: HashMap<u64, Vec<u64>>,
    pub waves: Vec<Vec<u64>>,
}

/// Persistence seam for fleet runs.
///
/// Guarantees expected by the engine:
/// - writes from concurrent issues may interleave freely;
/// - `issue_status` reflects the latest `set_issue_status` for that issue;
/// - a phase re-entered via `start_phase` overwrites the prior entry.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Mark a phase as started for an issue.
    async fn start_phase(&self, issue: u64, phase: u32) -> StorageResult<()>;

    /// Mark a phase as completed, recording the produced artifact path.
    async fn complete_phase(&self, issue: u64, phase: u32, artifact: &Path) -> StorageResult<()>;

    /// Attach a gate verdict to a phase.
    async fn record_gate_result(
        &self,
        issue: u64,
        phase: u32,
        gate: &GateRecord,
    ) -> StorageResult<()>;

    /// Append a token-usage record for an issue.
    async fn record_token_usage(
        &self,
        issue: u64,
        source: &str,
        phase: u32,
        tokens: u64,
    ) -> StorageResult<()>;

    /// Latest recorded status for an issue, if any.
    async fn issue_status(&self, issue: u64) -> StorageResult<Option<IssueStatus>>;

    /// Record a status for an issue.
    async fn set_issue_status(&self, issue: u64, status: IssueStatus) -> StorageResult<()>;

    /// Record the resolved dependency graph and its wave partition.
    async fn set_dag(
        &self,
        edges: &HashMap<u64, Vec<u64>>,
        waves: &[Vec<u64>],
    ) -> StorageResult<()>;

    /// Whether an issue already reached `Completed` (used for resume).
    async fn is_issue_completed(&self, issue: u64) -> StorageResult<bool> {
        Ok(matches!(
            self.issue_status(issue).await?,
            Some(IssueStatus::Completed)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_status_serializes_kebab_case() {
        let json = serde_json::to_string(&IssueStatus::DepMergeConflict).unwrap();
        assert_eq!(json, "\"dep-merge-conflict\"");
    }

    #[test]
    fn test_issue_checkpoint_total_tokens_sums_records() {
        let mut cp = IssueCheckpoint::default();
        cp.tokens.push(TokenRecord {
            source: "agent".to_string(),
            phase: 1,
            tokens: 30,
            recorded_at: Utc::now(),
        });
        cp.tokens.push(TokenRecord {
            source: "agent".to_string(),
            phase: 2,
            tokens: 70,
            recorded_at: Utc::now(),
        });
        assert_eq!(cp.total_tokens(), 100);
    }
}
