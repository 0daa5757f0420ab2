//! In-memory fakes for the persistence traits (testing only).
//!
//! Provides `MemoryCheckpoint`, which satisfies the [`CheckpointStore`]
//! contract without touching the filesystem.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::checkpoint::{
    CheckpointStore, DagRecord, GateRecord, IssueCheckpoint, IssueStatus, PhaseCheckpoint,
    TokenRecord,
};
use crate::error::StorageResult;

/// In-memory checkpoint store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    issues: Mutex<HashMap<u64, IssueCheckpoint>>,
    dag: Mutex<Option<DagRecord>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one issue's record, for assertions.
    pub fn issue(&self, issue: u64) -> Option<IssueCheckpoint> {
        self.issues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&issue)
            .cloned()
    }

    /// Latest recorded status for an issue, for assertions.
    pub fn status(&self, issue: u64) -> Option<IssueStatus> {
        self.issues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&issue)
            .and_then(|i| i.status)
    }

    /// Snapshot of the recorded DAG metadata, for assertions.
    pub fn dag(&self) -> Option<DagRecord> {
        self.dag.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn start_phase(&self, issue: u64, phase: u32) -> StorageResult<()> {
        let mut issues = self.issues.lock().unwrap_or_else(|e| e.into_inner());
        let entry = issues.entry(issue).or_default();
        entry.phases.insert(
            phase,
            PhaseCheckpoint {
                started_at: Some(Utc::now()),
                ..PhaseCheckpoint::default()
            },
        );
        if entry.status.is_none() {
            entry.status = Some(IssueStatus::InProgress);
        }
        Ok(())
    }

    async fn complete_phase(&self, issue: u64, phase: u32, artifact: &Path) -> StorageResult<()> {
        let mut issues = self.issues.lock().unwrap_or_else(|e| e.into_inner());
        let record = issues.entry(issue).or_default().phases.entry(phase).or_default();
        record.completed_at = Some(Utc::now());
        record.artifact = Some(artifact.to_path_buf());
        Ok(())
    }

    async fn record_gate_result(
        &self,
        issue: u64,
        phase: u32,
        gate: &GateRecord,
    ) -> StorageResult<()> {
        let mut issues = self.issues.lock().unwrap_or_else(|e| e.into_inner());
        issues
            .entry(issue)
            .or_default()
            .phases
            .entry(phase)
            .or_default()
            .gate = Some(gate.clone());
        Ok(())
    }

    async fn record_token_usage(
        &self,
        issue: u64,
        source: &str,
        phase: u32,
        tokens: u64,
    ) -> StorageResult<()> {
        let mut issues = self.issues.lock().unwrap_or_else(|e| e.into_inner());
        issues.entry(issue).or_default().tokens.push(TokenRecord {
            source: source.to_string(),
            phase,
            tokens,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn issue_status(&self, issue: u64) -> StorageResult<Option<IssueStatus>> {
        let issues = self.issues.lock().unwrap_or_else(|e| e.into_inner());
        Ok(issues.get(&issue).and_then(|i| i.status))
    }

    async fn set_issue_status(&self, issue: u64, status: IssueStatus) -> StorageResult<()> {
        let mut issues = self.issues.lock().unwrap_or_else(|e| e.into_inner());
        issues.entry(issue).or_default().status = Some(status);
        Ok(())
    }

    async fn set_dag(
        &self,
        edges: &HashMap<u64, Vec<u64>>,
        waves: &[Vec<u64>],
    ) -> StorageResult<()> {
        let mut dag = self.dag.lock().unwrap_or_else(|e| e.into_inner());
        *dag = Some(DagRecord {
            edges: edges.clone(),
            waves: waves.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_checkpoint_contract() {
        let cp = MemoryCheckpoint::new();

        cp.start_phase(1, 1).await.unwrap();
        cp.complete_phase(1, 1, Path::new("phase-1.json")).await.unwrap();
        cp.record_token_usage(1, "agent", 1, 42).await.unwrap();
        cp.set_issue_status(1, IssueStatus::Completed).await.unwrap();

        assert!(cp.is_issue_completed(1).await.unwrap());
        assert!(!cp.is_issue_completed(2).await.unwrap());

        let record = cp.issue(1).unwrap();
        assert_eq!(record.total_tokens(), 42);
        assert!(record.phases[&1].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_start_phase_resets_prior_entry() {
        let cp = MemoryCheckpoint::new();
        cp.start_phase(1, 2).await.unwrap();
        cp.complete_phase(1, 2, Path::new("a.json")).await.unwrap();
        cp.start_phase(1, 2).await.unwrap();

        let record = cp.issue(1).unwrap();
        assert!(record.phases[&2].completed_at.is_none());
    }
}
