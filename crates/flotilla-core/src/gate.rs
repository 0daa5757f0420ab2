//! Quality-gate coordination: runs the validators registered for a phase
//! and merges their verdicts.
//!
//! Gates are opt-in per phase: a phase with no registered validators
//! passes immediately. The combined verdict is returned to the caller (the
//! phase runner merges it into its own result record) and persisted through
//! the checkpoint store, with a human-readable progress event appended.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use flotilla_state::CheckpointStore;

use crate::error::Result;
use crate::model::{GateResult, GateStatus, Phase};
use crate::traits::{GateContext, GateValidator, ProgressWriter};

/// Runs zero or more validators per phase and merges their verdicts.
pub struct GateCoordinator {
    validators: HashMap<Phase, Vec<Arc<dyn GateValidator>>>,
    checkpoint: Arc<dyn CheckpointStore>,
    progress: Arc<dyn ProgressWriter>,
}

impl GateCoordinator {
    pub fn new(checkpoint: Arc<dyn CheckpointStore>, progress: Arc<dyn ProgressWriter>) -> Self {
        Self {
            validators: HashMap::new(),
            checkpoint,
            progress,
        }
    }

    /// Register a validator for a phase. Validators run (and their
    /// messages concatenate) in registration order.
    pub fn register(&mut self, phase: Phase, validator: Arc<dyn GateValidator>) {
        self.validators.entry(phase).or_default().push(validator);
    }

    /// Whether any validator is registered for the phase.
    pub fn has_gate(&self, phase: Phase) -> bool {
        self.validators
            .get(&phase)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Run the gate for a phase against its output.
    ///
    /// Combine rule: overall status is `fail` if any validator failed, else
    /// `warn` if any warned, else `pass`. A validator that errors instead
    /// of producing a verdict counts as a failure with its error message.
    pub async fn run_gate(&self, ctx: &GateContext) -> Result<GateResult> {
        let Some(validators) = self.validators.get(&ctx.phase).filter(|v| !v.is_empty()) else {
            debug!(issue = ctx.issue, phase = ctx.phase.number(), "no gate registered");
            return Ok(GateResult::pass());
        };

        let mut combined = GateResult::pass();
        for validator in validators {
            let verdict = match validator.validate(ctx).await {
                Ok(v) => v,
                Err(e) => GateResult::fail(vec![format!(
                    "validator '{}' errored: {e:#}",
                    validator.name()
                )]),
            };
            combined.merge(verdict);
        }

        self.checkpoint
            .record_gate_result(ctx.issue, ctx.phase.number(), &combined.to_record())
            .await?;

        let summary = match combined.status {
            GateStatus::Pass => format!("Gate phase {}: passed", ctx.phase.number()),
            GateStatus::Warn => format!(
                "Gate phase {}: passed with {} warning(s)",
                ctx.phase.number(),
                combined.warnings.len()
            ),
            GateStatus::Fail => format!(
                "Gate phase {}: failed: {}",
                ctx.phase.number(),
                combined.errors.join("; ")
            ),
        };
        info!(issue = ctx.issue, "{summary}");
        self.progress.append_event(&summary).await;

        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryProgress;
    use async_trait::async_trait;
    use flotilla_state::fakes::MemoryCheckpoint;
    use std::path::PathBuf;

    struct FixedValidator {
        name: &'static str,
        verdict: GateResult,
    }

    #[async_trait]
    impl GateValidator for FixedValidator {
        fn name(&self) -> &str {
            self.name
        }

        async fn validate(&self, _ctx: &GateContext) -> anyhow::Result<GateResult> {
            Ok(self.verdict.clone())
        }
    }

    struct BrokenValidator;

    #[async_trait]
    impl GateValidator for BrokenValidator {
        fn name(&self) -> &str {
            "broken"
        }

        async fn validate(&self, _ctx: &GateContext) -> anyhow::Result<GateResult> {
            anyhow::bail!("could not read working tree")
        }
    }

    fn ctx() -> GateContext {
        GateContext {
            issue: 1,
            phase: Phase::Implementation,
            output: Some(PathBuf::from("out.json")),
            workdir: PathBuf::from("."),
        }
    }

    fn coordinator() -> (GateCoordinator, Arc<MemoryCheckpoint>, Arc<MemoryProgress>) {
        let checkpoint = Arc::new(MemoryCheckpoint::new());
        let progress = Arc::new(MemoryProgress::new());
        let coord = GateCoordinator::new(
            Arc::clone(&checkpoint) as Arc<dyn CheckpointStore>,
            Arc::clone(&progress) as Arc<dyn ProgressWriter>,
        );
        (coord, checkpoint, progress)
    }

    #[tokio::test]
    async fn test_no_validators_passes_immediately() {
        let (coord, checkpoint, progress) = coordinator();
        let result = coord.run_gate(&ctx()).await.unwrap();
        assert_eq!(result.status, GateStatus::Pass);
        // Opt-out phases record nothing.
        assert!(checkpoint.issue(1).is_none());
        assert!(progress.lines().is_empty());
    }

    #[tokio::test]
    async fn test_warn_plus_fail_combines_to_fail_with_all_messages() {
        let (mut coord, _checkpoint, progress) = coordinator();
        coord.register(
            Phase::Implementation,
            Arc::new(FixedValidator {
                name: "style",
                verdict: GateResult::warn(vec!["naming drift".to_string()]),
            }),
        );
        coord.register(
            Phase::Implementation,
            Arc::new(FixedValidator {
                name: "tests",
                verdict: GateResult::fail(vec!["2 tests failed".to_string()]),
            }),
        );

        let result = coord.run_gate(&ctx()).await.unwrap();
        assert_eq!(result.status, GateStatus::Fail);
        assert_eq!(result.warnings, vec!["naming drift".to_string()]);
        assert_eq!(result.errors, vec!["2 tests failed".to_string()]);
        assert!(progress.lines()[0].contains("failed: 2 tests failed"));
    }

    #[tokio::test]
    async fn test_warnings_only_yield_warn_event() {
        let (mut coord, _checkpoint, progress) = coordinator();
        coord.register(
            Phase::Implementation,
            Arc::new(FixedValidator {
                name: "style",
                verdict: GateResult::warn(vec!["a".to_string(), "b".to_string()]),
            }),
        );

        let result = coord.run_gate(&ctx()).await.unwrap();
        assert_eq!(result.status, GateStatus::Warn);
        assert!(progress.lines()[0].contains("passed with 2 warning(s)"));
    }

    #[tokio::test]
    async fn test_erroring_validator_counts_as_failure() {
        let (mut coord, checkpoint, _progress) = coordinator();
        coord.register(Phase::Implementation, Arc::new(BrokenValidator));

        let result = coord.run_gate(&ctx()).await.unwrap();
        assert_eq!(result.status, GateStatus::Fail);
        assert!(result.errors[0].contains("broken"));

        // The combined verdict is persisted against the phase.
        let record = checkpoint.issue(1).unwrap();
        assert_eq!(record.phases[&3].gate.as_ref().unwrap().status, "fail");
    }

    #[tokio::test]
    async fn test_gate_registered_for_other_phase_does_not_apply() {
        let (mut coord, _checkpoint, _progress) = coordinator();
        coord.register(
            Phase::Delivery,
            Arc::new(FixedValidator {
                name: "release",
                verdict: GateResult::fail(vec!["nope".to_string()]),
            }),
        );
        assert!(!coord.has_gate(Phase::Implementation));
        let result = coord.run_gate(&ctx()).await.unwrap();
        assert_eq!(result.status, GateStatus::Pass);
    }
}
