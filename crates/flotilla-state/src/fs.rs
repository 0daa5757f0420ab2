//! JSON-file-backed checkpoint store.
//!
//! One fleet run persists into one pretty-printed JSON document. Every
//! mutation rewrites the whole file; the document is small (one record per
//! issue) and the rewrite keeps resume semantics trivial: reopen the path
//! and the previous run's state is back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{
    CheckpointStore, DagRecord, GateRecord, IssueCheckpoint, IssueStatus, PhaseCheckpoint,
    TokenRecord,
};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CheckpointDoc {
    issues: HashMap<u64, IssueCheckpoint>,
    dag: Option<DagRecord>,
    updated_at: Option<DateTime<Utc>>,
}

/// Checkpoint store persisting to a single JSON file.
pub struct FsCheckpoint {
    path: PathBuf,
    doc: Mutex<CheckpointDoc>,
}

impl FsCheckpoint {
    /// Open (or create) a checkpoint file at `path`.
    ///
    /// A missing file starts an empty run; an unparsable file is an error
    /// rather than a silent reset, so a corrupted checkpoint never causes
    /// completed work to be re-run from scratch unnoticed.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| StorageError::Io {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        } else {
            CheckpointDoc::default()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every issue record, for reporting.
    pub fn issues(&self) -> HashMap<u64, IssueCheckpoint> {
        self.doc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .issues
            .clone()
    }

    /// Snapshot of the recorded DAG metadata, if a run stored one.
    pub fn dag_record(&self) -> Option<DagRecord> {
        self.doc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dag
            .clone()
    }

    fn mutate<F>(&self, apply: F) -> StorageResult<()>
    where
        F: FnOnce(&mut CheckpointDoc),
    {
        let mut doc = self.doc.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut doc);
        doc.updated_at = Some(Utc::now());
        let json = serde_json::to_vec_pretty(&*doc)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        std::fs::write(&self.path, json).map_err(|source| StorageError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpoint {
    async fn start_phase(&self, issue: u64, phase: u32) -> StorageResult<()> {
        self.mutate(|doc| {
            let entry = doc.issues.entry(issue).or_default();
            // Re-entering a phase (gate retry) resets its record.
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
        })
    }

    async fn complete_phase(&self, issue: u64, phase: u32, artifact: &Path) -> StorageResult<()> {
        let artifact = artifact.to_path_buf();
        self.mutate(|doc| {
            let entry = doc.issues.entry(issue).or_default();
            let record = entry.phases.entry(phase).or_default();
            record.completed_at = Some(Utc::now());
            record.artifact = Some(artifact);
        })
    }

    async fn record_gate_result(
        &self,
        issue: u64,
        phase: u32,
        gate: &GateRecord,
    ) -> StorageResult<()> {
        let gate = gate.clone();
        self.mutate(|doc| {
            let entry = doc.issues.entry(issue).or_default();
            entry.phases.entry(phase).or_default().gate = Some(gate);
        })
    }

    async fn record_token_usage(
        &self,
        issue: u64,
        source: &str,
        phase: u32,
        tokens: u64,
    ) -> StorageResult<()> {
        let record = TokenRecord {
            source: source.to_string(),
            phase,
            tokens,
            recorded_at: Utc::now(),
        };
        self.mutate(|doc| {
            doc.issues.entry(issue).or_default().tokens.push(record);
        })
    }

    async fn issue_status(&self, issue: u64) -> StorageResult<Option<IssueStatus>> {
        let doc = self.doc.lock().unwrap_or_else(|e| e.into_inner());
        Ok(doc.issues.get(&issue).and_then(|i| i.status))
    }

    async fn set_issue_status(&self, issue: u64, status: IssueStatus) -> StorageResult<()> {
        self.mutate(|doc| {
            doc.issues.entry(issue).or_default().status = Some(status);
        })
    }

    async fn set_dag(
        &self,
        edges: &HashMap<u64, Vec<u64>>,
        waves: &[Vec<u64>],
    ) -> StorageResult<()> {
        let record = DagRecord {
            edges: edges.clone(),
            waves: waves.to_vec(),
        };
        self.mutate(|doc| {
            doc.dag = Some(record);
        })
    }
}
