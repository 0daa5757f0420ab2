//! Fleet run reporting.
//!
//! Aggregates the per-item outcomes of a run into a [`FleetSummary`] and
//! renders it as the plain-text report the CLI prints at the end of a run.

use std::collections::HashMap;

use serde::Serialize;

use flotilla_state::IssueStatus;

use crate::scheduler::ItemOutcome;

/// Aggregated counts and per-item lines for one fleet run.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub tokens_used: u64,
    pub items: Vec<ItemSummary>,
}

/// One line of the report.
#[derive(Debug, Clone, Serialize)]
pub struct ItemSummary {
    pub number: u64,
    pub title: String,
    /// "completed", "failed", "blocked" or "skipped".
    pub status: String,
    pub tokens_used: u64,
    pub detail: Option<String>,
}

impl FleetSummary {
    /// Build a summary from scheduler outcomes, folding in merge-queue
    /// failures recorded after the pipelines finished.
    pub fn from_outcomes(
        outcomes: &[ItemOutcome],
        merge_failures: &HashMap<u64, String>,
    ) -> FleetSummary {
        let mut summary = FleetSummary {
            total: outcomes.len(),
            completed: 0,
            failed: 0,
            blocked: 0,
            skipped: 0,
            tokens_used: 0,
            items: Vec::with_capacity(outcomes.len()),
        };

        for outcome in outcomes {
            let item = match outcome {
                ItemOutcome::Completed(report) => {
                    // A merge failure demotes a completed pipeline.
                    if let Some(reason) = merge_failures.get(&report.number) {
                        summary.failed += 1;
                        ItemSummary {
                            number: report.number,
                            title: report.title.clone(),
                            status: "failed".to_string(),
                            tokens_used: report.tokens_used,
                            detail: Some(reason.clone()),
                        }
                    } else {
                        summary.completed += 1;
                        ItemSummary {
                            number: report.number,
                            title: report.title.clone(),
                            status: "completed".to_string(),
                            tokens_used: report.tokens_used,
                            detail: None,
                        }
                    }
                }
                ItemOutcome::Failed(report) => {
                    summary.failed += 1;
                    ItemSummary {
                        number: report.number,
                        title: report.title.clone(),
                        status: "failed".to_string(),
                        tokens_used: report.tokens_used,
                        detail: report.error.clone(),
                    }
                }
                ItemOutcome::Blocked {
                    number,
                    title,
                    blocked_on,
                    status,
                } => {
                    summary.blocked += 1;
                    ItemSummary {
                        number: *number,
                        title: title.clone(),
                        status: "blocked".to_string(),
                        tokens_used: 0,
                        detail: Some(format!(
                            "blocked by issue {blocked_on} ({})",
                            status_label(*status)
                        )),
                    }
                }
                ItemOutcome::Skipped { number } => {
                    summary.skipped += 1;
                    ItemSummary {
                        number: *number,
                        title: String::new(),
                        status: "skipped".to_string(),
                        tokens_used: 0,
                        detail: Some("completed in an earlier run".to_string()),
                    }
                }
            };
            summary.tokens_used += item.tokens_used;
            summary.items.push(item);
        }

        summary
    }

    /// Whether the run as a whole succeeded.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}

fn status_label(status: IssueStatus) -> &'static str {
    match status {
        IssueStatus::InProgress => "in-progress",
        IssueStatus::Completed => "completed",
        IssueStatus::Failed => "failed",
        IssueStatus::DepFailed => "dep-failed",
        IssueStatus::DepBlocked => "dep-blocked",
        IssueStatus::DepMergeConflict => "dep-merge-conflict",
    }
}

/// Render the plain-text report, optionally including the wave partition.
pub fn render_fleet_summary(summary: &FleetSummary, waves: Option<&[Vec<u64>]>) -> String {
    let mut out = String::new();
    out.push_str("Fleet run summary\n");
    out.push_str(&format!(
        "  items: {} total, {} completed, {} failed, {} blocked, {} skipped\n",
        summary.total, summary.completed, summary.failed, summary.blocked, summary.skipped
    ));
    out.push_str(&format!("  tokens used: {}\n\n", summary.tokens_used));

    for item in &summary.items {
        out.push_str(&format!(
            "  #{:<6} {:<11} {}",
            item.number, item.status, item.title
        ));
        if item.tokens_used > 0 {
            out.push_str(&format!(" [{} tokens]", item.tokens_used));
        }
        if let Some(detail) = &item.detail {
            out.push_str(&format!("\n          {detail}"));
        }
        out.push('\n');
    }

    if let Some(waves) = waves {
        out.push_str("\n  waves:\n");
        for (index, wave) in waves.iter().enumerate() {
            let numbers: Vec<String> = wave.iter().map(|n| format!("#{n}")).collect();
            out.push_str(&format!("    {}: {}\n", index + 1, numbers.join(", ")));
        }
    }

    out
}
