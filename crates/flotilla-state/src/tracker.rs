//! Shared per-issue token accounting.
//!
//! [`TokenTracker`] is an append-only usage accumulator shared by every
//! in-flight issue. Writers only ever add; classification reads the latest
//! total, so a lost-update race can delay a warning/exceeded transition but
//! never reverse one.

use std::collections::HashMap;
use std::sync::Mutex;

/// Fraction of the budget at which usage is classified as a warning.
pub const DEFAULT_WARNING_RATIO: f64 = 0.8;

/// Budget classification for one issue's running total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Below the warning threshold.
    Within,
    /// At or above the warning threshold, but not over budget.
    Warning,
    /// Over budget.
    Exceeded,
}

/// Input/output token totals for one issue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Append-only token accumulator shared across concurrent issues.
#[derive(Debug, Default)]
pub struct TokenTracker {
    totals: Mutex<HashMap<u64, TokenTotals>>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an input/output token decomposition to an issue's running total.
    pub fn record(&self, issue: u64, input: u64, output: u64) {
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        let entry = totals.entry(issue).or_default();
        entry.input += input;
        entry.output += output;
    }

    /// Current combined total for an issue (0 if never recorded).
    pub fn total(&self, issue: u64) -> u64 {
        let totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.get(&issue).copied().unwrap_or_default().total()
    }

    /// Classify an issue's usage against a budget.
    ///
    /// A budget of 0 means "unlimited" and always classifies as `Within`.
    pub fn status(&self, issue: u64, budget: u64) -> BudgetStatus {
        if budget == 0 {
            return BudgetStatus::Within;
        }
        let used = self.total(issue);
        if used > budget {
            BudgetStatus::Exceeded
        } else if (used as f64) >= (budget as f64) * DEFAULT_WARNING_RATIO {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Within
        }
    }

    /// Snapshot of all per-issue totals, for reporting.
    pub fn snapshot(&self) -> HashMap<u64, TokenTotals> {
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
