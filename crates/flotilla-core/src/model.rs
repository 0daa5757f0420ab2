//! Domain model for fleet runs: work items, phases, gate verdicts and the
//! per-phase result records the pipeline accumulates.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use flotilla_state::GateRecord;

/// A unit of work carried through the phase pipeline. Owned by the caller
/// and immutable for the duration of a run; the engine references it by
/// number only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// Externally-sourced identifier (e.g. an issue number).
    pub number: u64,
    /// Human-readable title.
    pub title: String,
}

impl WorkItem {
    pub fn new(number: u64, title: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
        }
    }
}

/// The fixed five-phase pipeline every item moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analysis,
    Planning,
    Implementation,
    IntegrationVerification,
    Delivery,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 5] = [
        Phase::Analysis,
        Phase::Planning,
        Phase::Implementation,
        Phase::IntegrationVerification,
        Phase::Delivery,
    ];

    /// 1-based phase number.
    pub fn number(self) -> u32 {
        match self {
            Phase::Analysis => 1,
            Phase::Planning => 2,
            Phase::Implementation => 3,
            Phase::IntegrationVerification => 4,
            Phase::Delivery => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Analysis => "analysis",
            Phase::Planning => "planning",
            Phase::Implementation => "implementation",
            Phase::IntegrationVerification => "integration-verification",
            Phase::Delivery => "delivery",
        }
    }

    /// Look a phase up by its 1-based number.
    pub fn from_number(n: u32) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.number() == n)
    }
}

/// Gate verdict severity, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Warn,
    Fail,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GateStatus::Pass => "pass",
            GateStatus::Warn => "warn",
            GateStatus::Fail => "fail",
        }
    }
}

/// Combined verdict of the validators run after a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub status: GateStatus,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl GateResult {
    /// A clean pass with no messages.
    pub fn pass() -> Self {
        Self {
            status: GateStatus::Pass,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(warnings: Vec<String>) -> Self {
        Self {
            status: GateStatus::Warn,
            warnings,
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Self {
            status: GateStatus::Fail,
            warnings: Vec::new(),
            errors,
        }
    }

    /// Fold another validator's verdict into this one: worst status wins,
    /// messages concatenate in merge order.
    pub fn merge(&mut self, other: GateResult) {
        self.status = self.status.max(other.status);
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
    }

    /// Convert to the persistence-layer record shape.
    pub fn to_record(&self) -> GateRecord {
        GateRecord {
            status: self.status.as_str().to_string(),
            warnings: self.warnings.clone(),
            errors: self.errors.clone(),
        }
    }
}

/// Result of one phase attempt. The pipeline's result list holds one entry
/// per phase executed; a retried phase replaces its entry rather than
/// appending a second one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: u32,
    pub phase_name: String,
    pub success: bool,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub output: Option<PathBuf>,
    pub gate: Option<GateResult>,
    pub error: Option<String>,
}

/// An item queued for asynchronous PR completion. Immutable once enqueued;
/// at most one entry per PR number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub number: u64,
    pub title: String,
    pub pr_number: u64,
    pub pr_url: String,
    pub branch: String,
    /// Item numbers this item's merge must wait for.
    pub depends_on: Vec<u64>,
}

/// Scope a notification applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum NotificationScope {
    Fleet,
    Issue(u64),
}

/// A fire-and-forget event dispatched to the notification sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: uuid::Uuid,
    pub kind: String,
    #[serde(flatten)]
    pub scope: NotificationScope,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: impl Into<String>, scope: NotificationScope, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind: kind.into(),
            scope,
            payload,
            created_at: Utc::now(),
        }
    }

    /// The single warning fired when an issue crosses its budget threshold.
    pub fn budget_warning(issue: u64, used: u64, budget: u64) -> Self {
        let percent = if budget == 0 {
            0.0
        } else {
            (used as f64 / budget as f64) * 100.0
        };
        Self::new(
            "budget-warning",
            NotificationScope::Issue(issue),
            json!({
                "used": used,
                "budget": budget,
                "percent_used": percent,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_ordered_one_through_five() {
        let numbers: Vec<u32> = Phase::ALL.iter().map(|p| p.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(Phase::from_number(3), Some(Phase::Implementation));
        assert_eq!(Phase::from_number(6), None);
    }

    #[test]
    fn test_gate_merge_takes_worst_status() {
        let mut combined = GateResult::pass();
        combined.merge(GateResult::warn(vec!["style drift".to_string()]));
        assert_eq!(combined.status, GateStatus::Warn);
        combined.merge(GateResult::fail(vec!["tests failed".to_string()]));
        assert_eq!(combined.status, GateStatus::Fail);
        // A later pass never improves the verdict.
        combined.merge(GateResult::pass());
        assert_eq!(combined.status, GateStatus::Fail);
        assert_eq!(combined.warnings, vec!["style drift".to_string()]);
        assert_eq!(combined.errors, vec!["tests failed".to_string()]);
    }

    #[test]
    fn test_budget_warning_payload_carries_percent() {
        let n = Notification::budget_warning(7, 80, 100);
        assert_eq!(n.kind, "budget-warning");
        assert_eq!(n.scope, NotificationScope::Issue(7));
        assert_eq!(n.payload["percent_used"], 80.0);
    }
}
