//! Single-phase execution: run an executor, gate its output, retry once on
//! a gate failure.
//!
//! The runner produces exactly one [`PhaseResult`] per phase it is asked to
//! run. A gate failure triggers one full re-execution of the phase; the
//! retry's result replaces the first attempt's. A second gate failure makes
//! the phase fail outright. Token usage is attributed by diffing the shared
//! tracker around the attempt, so agent spends recorded mid-flight land in
//! the right result.
//!
//! Budget exhaustion is the one error that escapes: an executor error whose
//! chain carries [`FleetError::BudgetExceeded`] propagates typed instead of
//! becoming a failed result, so the item pipeline can stop scheduling
//! further phases.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use flotilla_state::{CheckpointStore, TokenTracker};

use crate::error::{FleetError, Result};
use crate::gate::GateCoordinator;
use crate::model::{GateStatus, Phase, PhaseResult};
use crate::traits::{GateContext, PhaseContext, PhaseExecutor, ProgressWriter};

/// Runs phases for one fleet and persists their progress.
pub struct PhaseRunner {
    checkpoint: Arc<dyn CheckpointStore>,
    gates: Arc<GateCoordinator>,
    progress: Arc<dyn ProgressWriter>,
    tracker: Arc<TokenTracker>,
}

impl PhaseRunner {
    pub fn new(
        checkpoint: Arc<dyn CheckpointStore>,
        gates: Arc<GateCoordinator>,
        progress: Arc<dyn ProgressWriter>,
        tracker: Arc<TokenTracker>,
    ) -> Self {
        Self {
            checkpoint,
            gates,
            progress,
            tracker,
        }
    }

    /// Execute one phase for an item, including the single gate-triggered
    /// retry.
    pub async fn run_phase(
        &self,
        executor: &dyn PhaseExecutor,
        issue: u64,
        title: &str,
        phase: Phase,
        workdir: &Path,
    ) -> Result<PhaseResult> {
        let first = self
            .execute_once(executor, issue, title, phase, workdir, 1)
            .await?;

        let gate_failed = first
            .gate
            .as_ref()
            .map(|g| g.status == GateStatus::Fail)
            .unwrap_or(false);
        if !gate_failed {
            return Ok(first);
        }

        warn!(issue, phase = phase.number(), "gate failed, re-executing phase once");
        self.progress
            .append_event(&format!(
                "Phase {} gate failed for issue {issue}; re-executing once",
                phase.number()
            ))
            .await;

        let mut retry = self
            .execute_once(executor, issue, title, phase, workdir, 2)
            .await?;

        let retry_gate_failed = retry
            .gate
            .as_ref()
            .map(|g| g.status == GateStatus::Fail)
            .unwrap_or(false);
        if retry_gate_failed {
            let errors = retry
                .gate
                .as_ref()
                .map(|g| g.errors.join("; "))
                .unwrap_or_default();
            retry.success = false;
            retry.error = Some(format!(
                "phase {} gate failed after retry: {errors}",
                phase.number()
            ));
        }

        Ok(retry)
    }

    /// One attempt: start-phase checkpoint, executor, complete-phase
    /// checkpoint, gate.
    async fn execute_once(
        &self,
        executor: &dyn PhaseExecutor,
        issue: u64,
        title: &str,
        phase: Phase,
        workdir: &Path,
        attempt: u32,
    ) -> Result<PhaseResult> {
        info!(issue, phase = phase.number(), name = phase.name(), attempt, "phase starting");
        self.checkpoint.start_phase(issue, phase.number()).await?;

        let tokens_before = self.tracker.total(issue);
        let started = Instant::now();

        let ctx = PhaseContext {
            issue,
            title: title.to_string(),
            phase,
            workdir: workdir.to_path_buf(),
            attempt,
        };

        let output = match executor.execute(&ctx).await {
            Ok(output) => output,
            Err(err) => {
                // Budget exhaustion aborts the item; anything else is an
                // ordinary phase failure.
                let err = match err.downcast::<FleetError>() {
                    Ok(fe @ FleetError::BudgetExceeded { .. }) => return Err(fe),
                    Ok(fe) => anyhow::Error::new(fe),
                    Err(original) => original,
                };
                let message = format!("{err:#}");
                warn!(issue, phase = phase.number(), error = %message, "phase failed");
                return Ok(PhaseResult {
                    phase: phase.number(),
                    phase_name: phase.name().to_string(),
                    success: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                    tokens_used: self.tracker.total(issue) - tokens_before,
                    output: None,
                    gate: None,
                    error: Some(message),
                });
            }
        };

        self.checkpoint
            .complete_phase(issue, phase.number(), &output)
            .await?;

        let gate = self
            .gates
            .run_gate(&GateContext {
                issue,
                phase,
                output: Some(output.clone()),
                workdir: workdir.to_path_buf(),
            })
            .await?;

        let tokens_used = self.tracker.total(issue) - tokens_before;
        info!(
            issue,
            phase = phase.number(),
            tokens_used,
            gate = gate.status.as_str(),
            "phase completed"
        );

        Ok(PhaseResult {
            phase: phase.number(),
            phase_name: phase.name().to_string(),
            success: true,
            duration_ms: started.elapsed().as_millis() as u64,
            tokens_used,
            output: Some(output),
            gate: Some(gate),
            error: None,
        })
    }
}
