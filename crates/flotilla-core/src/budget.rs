//! Per-issue token-budget enforcement.
//!
//! [`IssueBudgetGuard`] forwards every spend to the shared
//! [`TokenTracker`] and to checkpoint persistence, then re-reads the
//! issue's classification. Crossing the warning threshold dispatches
//! exactly one `budget-warning` notification; crossing the budget sets a
//! sticky exceeded flag that is never cleared for the life of the item.
//! Callers probe [`check_budget`](IssueBudgetGuard::check_budget) at phase
//! boundaries to abort early without double-charging tokens already spent.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use flotilla_state::{BudgetStatus, CheckpointStore, TokenTracker};

use crate::error::{FleetError, Result};
use crate::model::Notification;
use crate::traits::NotificationSink;

/// Budget guard for a single work item.
pub struct IssueBudgetGuard {
    issue: u64,
    /// Token budget; 0 means unlimited.
    budget: u64,
    tracker: Arc<TokenTracker>,
    checkpoint: Arc<dyn CheckpointStore>,
    notifier: Arc<dyn NotificationSink>,
    current_phase: AtomicU32,
    /// Sticky: set on the first exceeded classification, never cleared.
    exceeded: AtomicBool,
    /// One-shot latch for the warning notification.
    warning_sent: AtomicBool,
}

impl IssueBudgetGuard {
    pub fn new(
        issue: u64,
        budget: u64,
        tracker: Arc<TokenTracker>,
        checkpoint: Arc<dyn CheckpointStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            issue,
            budget,
            tracker,
            checkpoint,
            notifier,
            current_phase: AtomicU32::new(0),
            exceeded: AtomicBool::new(false),
            warning_sent: AtomicBool::new(false),
        }
    }

    /// Tag subsequent spends with the phase they belong to.
    pub fn set_phase(&self, phase: u32) {
        self.current_phase.store(phase, Ordering::Relaxed);
    }

    /// Whether the sticky exceeded flag is set.
    pub fn is_exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }

    /// Record a spend and re-evaluate the issue's budget classification.
    ///
    /// A zero-token call is a no-op. "Exceeded" takes priority over
    /// "warning": once the sticky flag is set, no warning ever fires.
    pub async fn record_tokens(&self, source: &str, input: u64, output: u64) -> Result<()> {
        let total = input + output;
        if total == 0 {
            return Ok(());
        }

        let phase = self.current_phase.load(Ordering::Relaxed);
        self.tracker.record(self.issue, input, output);
        self.checkpoint
            .record_token_usage(self.issue, source, phase, total)
            .await?;

        match self.tracker.status(self.issue, self.budget) {
            BudgetStatus::Exceeded => {
                if !self.exceeded.swap(true, Ordering::SeqCst) {
                    warn!(
                        issue = self.issue,
                        used = self.tracker.total(self.issue),
                        budget = self.budget,
                        "token budget exceeded; remaining phases will abort"
                    );
                }
            }
            BudgetStatus::Warning => {
                if !self.exceeded.load(Ordering::SeqCst)
                    && !self.warning_sent.swap(true, Ordering::SeqCst)
                {
                    let used = self.tracker.total(self.issue);
                    debug!(issue = self.issue, used, budget = self.budget, "budget warning");
                    self.notifier
                        .dispatch(Notification::budget_warning(self.issue, used, self.budget))
                        .await;
                }
            }
            BudgetStatus::Within => {}
        }

        Ok(())
    }

    /// Fails with [`FleetError::BudgetExceeded`] iff the sticky flag is set.
    pub fn check_budget(&self) -> Result<()> {
        if self.exceeded.load(Ordering::SeqCst) {
            return Err(FleetError::BudgetExceeded {
                issue: self.issue,
                used: self.tracker.total(self.issue),
                budget: self.budget,
            });
        }
        Ok(())
    }
}
