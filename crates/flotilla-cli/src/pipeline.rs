//! Per-item pipeline: drives one issue through the five phases and hands
//! its pull request to the completion queue.
//!
//! This is the glue between the engine and the real adapters: an agent
//! process executes each phase (with bounded retries), a budget guard
//! meters its token spend, artifact gates check the output of the gated
//! phases, and a finished item's PR is discovered by its `issue-{n}` head
//! branch and enqueued for merging.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{info, warn};

use flotilla_core::scheduler::ItemReport;
use flotilla_core::traits::{
    AgentInvocation, AgentLauncher, GateContext, GateValidator, NotificationSink, PhaseContext,
    PhaseExecutor, PlatformProvider, PrFilter, ProgressWriter,
};
use flotilla_core::{
    FleetError, GateCoordinator, GateResult, IssueBudgetGuard, IssueDag, Phase, PhaseRunner,
    PullRequestCompletionQueue, QueueItem, RetryExecutor, RetryPolicy, WorkItem,
};
use flotilla_state::{CheckpointStore, TokenTracker};

/// Everything the per-item pipeline shares across items.
pub struct PipelineContext {
    pub checkpoint: Arc<dyn CheckpointStore>,
    pub tracker: Arc<TokenTracker>,
    pub notifier: Arc<dyn NotificationSink>,
    pub progress: Arc<dyn ProgressWriter>,
    pub launcher: Arc<dyn AgentLauncher>,
    pub platform: Arc<dyn PlatformProvider>,
    pub queue: Arc<PullRequestCompletionQueue>,
    pub dag: IssueDag,
    pub budget_tokens: u64,
    pub gated_phases: Vec<u32>,
    pub retry: RetryPolicy,
    /// Root under which each issue gets its own working directory.
    pub workroot: PathBuf,
}

/// Build the closure the scheduler calls once per ready item.
pub fn item_processor(
    ctx: Arc<PipelineContext>,
) -> impl Fn(WorkItem) -> BoxFuture<'static, Result<ItemReport>> + Clone + Send + Sync + 'static {
    move |item: WorkItem| {
        let ctx = Arc::clone(&ctx);
        async move { run_item(&ctx, item).await }.boxed()
    }
}

/// Run one item through all five phases and enqueue its PR on success.
pub async fn run_item(ctx: &PipelineContext, item: WorkItem) -> Result<ItemReport> {
    let workdir = ctx.workroot.join(format!("issue-{}", item.number));
    tokio::fs::create_dir_all(&workdir)
        .await
        .with_context(|| format!("could not create working directory for issue {}", item.number))?;

    let guard = Arc::new(IssueBudgetGuard::new(
        item.number,
        ctx.budget_tokens,
        Arc::clone(&ctx.tracker),
        Arc::clone(&ctx.checkpoint),
        Arc::clone(&ctx.notifier),
    ));

    let mut gates = GateCoordinator::new(Arc::clone(&ctx.checkpoint), Arc::clone(&ctx.progress));
    for phase in Phase::ALL {
        if ctx.gated_phases.contains(&phase.number()) {
            gates.register(phase, Arc::new(ArtifactGate));
        }
    }

    let runner = PhaseRunner::new(
        Arc::clone(&ctx.checkpoint),
        Arc::new(gates),
        Arc::clone(&ctx.progress),
        Arc::clone(&ctx.tracker),
    );
    let executor = AgentPhaseExecutor {
        launcher: Arc::clone(&ctx.launcher),
        guard: Arc::clone(&guard),
        retry: RetryExecutor::new(ctx.retry),
    };

    let mut phases = Vec::new();
    let mut success = true;
    let mut error = None;

    for phase in Phase::ALL {
        guard.set_phase(phase.number());
        if let Err(e) = guard.check_budget() {
            success = false;
            error = Some(e.to_string());
            break;
        }

        match runner
            .run_phase(&executor, item.number, &item.title, phase, &workdir)
            .await
        {
            Ok(result) => {
                let phase_ok = result.success;
                let phase_error = result.error.clone();
                phases.push(result);
                if !phase_ok {
                    success = false;
                    error = phase_error;
                    break;
                }
            }
            Err(e @ FleetError::BudgetExceeded { .. }) => {
                success = false;
                error = Some(e.to_string());
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if success {
        enqueue_pull_request(ctx, &item).await;
    }

    Ok(ItemReport {
        number: item.number,
        title: item.title,
        success,
        phases,
        tokens_used: ctx.tracker.total(item.number),
        error,
    })
}

/// Find the item's PR by its head branch and queue it for completion.
async fn enqueue_pull_request(ctx: &PipelineContext, item: &WorkItem) {
    let branch = format!("issue-{}", item.number);
    let filter = PrFilter {
        state: Some("open".to_string()),
        head_prefix: Some(branch.clone()),
    };

    match ctx.platform.list_pull_requests(&filter).await {
        Ok(pulls) => match pulls.into_iter().next() {
            Some(pr) => {
                info!(issue = item.number, pr = pr.number, "queueing PR for completion");
                ctx.queue.enqueue(QueueItem {
                    number: item.number,
                    title: item.title.clone(),
                    pr_number: pr.number,
                    pr_url: pr.url,
                    branch: pr.head_branch,
                    depends_on: ctx.dag.direct_deps(item.number).to_vec(),
                });
            }
            None => {
                warn!(issue = item.number, branch = %branch, "pipeline finished but no open PR found");
                ctx.progress
                    .append_event(&format!(
                        "Issue {} completed but no open PR with head '{branch}' was found",
                        item.number
                    ))
                    .await;
            }
        },
        Err(e) => {
            warn!(issue = item.number, error = %format!("{e:#}"), "PR discovery failed");
            ctx.progress
                .append_event(&format!(
                    "Issue {} completed but PR discovery failed: {e:#}",
                    item.number
                ))
                .await;
        }
    }
}

/// Phase executor backed by the external agent, with bounded retries.
struct AgentPhaseExecutor {
    launcher: Arc<dyn AgentLauncher>,
    guard: Arc<IssueBudgetGuard>,
    retry: RetryExecutor,
}

impl AgentPhaseExecutor {
    fn artifact_name(phase: Phase) -> String {
        format!("phase-{}.json", phase.number())
    }

    fn prompt(ctx: &PhaseContext) -> String {
        let task = match ctx.phase {
            Phase::Analysis => {
                "Analyze the issue: reproduce it if applicable and describe root cause and scope."
            }
            Phase::Planning => {
                "Plan the change: list the files to touch and the steps, referencing the analysis."
            }
            Phase::Implementation => {
                "Implement the planned change on a branch named after this issue."
            }
            Phase::IntegrationVerification => {
                "Run the project's tests and verify the change integrates cleanly."
            }
            Phase::Delivery => {
                "Open or update the pull request for this issue from its branch."
            }
        };
        format!(
            "Issue #{}: {}\nPhase {} ({}), attempt {}.\n{}\nWrite a JSON summary of this phase \
             to the file named by the FLOTILLA_OUTPUT_FILE environment variable.",
            ctx.issue,
            ctx.title,
            ctx.phase.number(),
            ctx.phase.name(),
            ctx.attempt,
            task
        )
    }
}

#[async_trait]
impl PhaseExecutor for AgentPhaseExecutor {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PathBuf> {
        let artifact = Self::artifact_name(ctx.phase);
        let invocation = AgentInvocation {
            purpose: format!("issue-{}-phase-{}", ctx.issue, ctx.phase.number()),
            prompt: Self::prompt(ctx),
            output_file: Some(PathBuf::from(&artifact)),
        };

        let issue = ctx.issue;
        let phase = ctx.phase.number();
        let outcome = self
            .retry
            .execute_with(
                |_attempt| {
                    let invocation = invocation.clone();
                    let workdir = ctx.workdir.clone();
                    let launcher = Arc::clone(&self.launcher);
                    let guard = Arc::clone(&self.guard);
                    let artifact = artifact.clone();
                    async move {
                        let result = launcher.launch_agent(&invocation, &workdir).await?;
                        // Tokens count even when the attempt fails.
                        if let Some(usage) = result.token_usage {
                            guard.record_tokens("agent", usage.input, usage.output).await?;
                        }
                        if result.timed_out {
                            bail!("agent timed out");
                        }
                        if !result.success {
                            bail!(result
                                .error
                                .unwrap_or_else(|| format!("agent exited with code {}", result.exit_code)));
                        }
                        if !result.output_exists {
                            bail!("agent did not write {artifact}");
                        }
                        Ok(workdir.join(&artifact))
                    }
                },
                |attempt, err| {
                    warn!(issue, phase, attempt, error = %err, "phase attempt failed, retrying");
                },
                None::<fn(String) -> std::future::Ready<Result<Option<PathBuf>>>>,
            )
            .await;

        // A budget crossed mid-phase dominates whatever the agent returned.
        self.guard.check_budget()?;

        match outcome.value {
            Some(path) => Ok(path),
            None => bail!(
                "phase failed after {} attempt(s): {}",
                outcome.attempts,
                outcome.error.unwrap_or_default()
            ),
        }
    }
}

/// Gate requiring the phase artifact to be non-empty, valid JSON. Entries
/// in a top-level "warnings" array demote the verdict to a warning.
struct ArtifactGate;

#[async_trait]
impl GateValidator for ArtifactGate {
    fn name(&self) -> &str {
        "artifact"
    }

    async fn validate(&self, ctx: &GateContext) -> Result<GateResult> {
        let Some(path) = &ctx.output else {
            return Ok(GateResult::fail(vec!["phase produced no artifact".to_string()]));
        };
        let raw = match tokio::fs::read_to_string(resolve(path, &ctx.workdir)).await {
            Ok(raw) => raw,
            Err(e) => {
                return Ok(GateResult::fail(vec![format!(
                    "artifact {} is unreadable: {e}",
                    path.display()
                )]))
            }
        };
        if raw.trim().is_empty() {
            return Ok(GateResult::fail(vec![format!(
                "artifact {} is empty",
                path.display()
            )]));
        }
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                return Ok(GateResult::fail(vec![format!(
                    "artifact {} is not valid JSON: {e}",
                    path.display()
                )]))
            }
        };

        let warnings: Vec<String> = value["warnings"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|w| w.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if warnings.is_empty() {
            Ok(GateResult::pass())
        } else {
            Ok(GateResult::warn(warnings))
        }
    }
}

fn resolve(path: &Path, workdir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::fakes::{MemoryProgress, RecordingNotifier, RecordingPlatform, StaticProbe};
    use flotilla_core::merge_queue::QueueConfig;
    use flotilla_core::traits::{AgentResult, DependencyProbe, MergeMethod, PullRequest};
    use flotilla_state::fakes::MemoryCheckpoint;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Launcher writing a valid artifact, failing the first `failures`
    /// launches.
    struct FlakyLauncher {
        failures: AtomicU32,
        tokens_per_call: u64,
    }

    #[async_trait]
    impl AgentLauncher for FlakyLauncher {
        async fn launch_agent(
            &self,
            invocation: &AgentInvocation,
            workdir: &Path,
        ) -> Result<AgentResult> {
            let usage = flotilla_core::traits::AgentTokenUsage {
                input: self.tokens_per_call,
                output: 0,
            };
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Ok(AgentResult {
                    success: false,
                    exit_code: 1,
                    timed_out: false,
                    output_exists: false,
                    token_usage: Some(usage),
                    error: Some("flaky".to_string()),
                });
            }
            let file = invocation.output_file.as_ref().unwrap();
            tokio::fs::write(workdir.join(file), r#"{"summary": "done"}"#).await?;
            Ok(AgentResult {
                success: true,
                exit_code: 0,
                timed_out: false,
                output_exists: true,
                token_usage: Some(usage),
                error: None,
            })
        }
    }

    fn context(
        launcher: Arc<dyn AgentLauncher>,
        platform: Arc<RecordingPlatform>,
        workroot: &Path,
        budget: u64,
    ) -> (Arc<PipelineContext>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let progress = Arc::new(MemoryProgress::new()) as Arc<dyn ProgressWriter>;
        let queue = Arc::new(PullRequestCompletionQueue::new(
            QueueConfig {
                enabled: true,
                base_branch: "main".to_string(),
                merge_method: Some(MergeMethod::Squash),
            },
            Arc::clone(&platform) as Arc<dyn PlatformProvider>,
            Arc::new(StaticProbe::new()) as Arc<dyn DependencyProbe>,
            Arc::clone(&progress),
        ));
        let dag = IssueDag::build(&[WorkItem::new(1, "demo")], &HashMap::new()).unwrap();

        let ctx = Arc::new(PipelineContext {
            checkpoint: Arc::new(MemoryCheckpoint::new()) as Arc<dyn CheckpointStore>,
            tracker: Arc::new(TokenTracker::new()),
            notifier: Arc::clone(&notifier) as Arc<dyn NotificationSink>,
            progress,
            launcher,
            platform: platform as Arc<dyn PlatformProvider>,
            queue,
            dag,
            budget_tokens: budget,
            gated_phases: vec![3, 4],
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 2,
            },
            workroot: workroot.to_path_buf(),
        });
        (ctx, notifier)
    }

    #[tokio::test]
    async fn test_happy_path_runs_five_phases_and_enqueues_the_pr() {
        let workroot = tempfile::tempdir().unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        platform.add_pull_request(PullRequest {
            number: 101,
            url: "https://example.test/pull/101".to_string(),
            head_branch: "issue-1".to_string(),
            state: "open".to_string(),
            merged: false,
        });
        let launcher = Arc::new(FlakyLauncher {
            failures: AtomicU32::new(0),
            tokens_per_call: 10,
        });
        let (ctx, _notifier) = context(launcher, Arc::clone(&platform), workroot.path(), 0);

        let report = run_item(&ctx, WorkItem::new(1, "demo")).await.unwrap();
        assert!(report.success);
        assert_eq!(report.phases.len(), 5);
        assert_eq!(report.tokens_used, 50);

        let completions = ctx.queue.drain().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(platform.merged(), vec![101]);
    }

    #[tokio::test]
    async fn test_flaky_agent_recovers_within_retry_budget() {
        let workroot = tempfile::tempdir().unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        let launcher = Arc::new(FlakyLauncher {
            failures: AtomicU32::new(2),
            tokens_per_call: 1,
        });
        let (ctx, _notifier) = context(launcher, platform, workroot.path(), 0);

        let report = run_item(&ctx, WorkItem::new(1, "demo")).await.unwrap();
        assert!(report.success);
        // 2 failed launches + 5 successful phases.
        assert_eq!(report.tokens_used, 7);
    }

    #[tokio::test]
    async fn test_persistently_failing_agent_fails_the_item() {
        let workroot = tempfile::tempdir().unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        let launcher = Arc::new(FlakyLauncher {
            failures: AtomicU32::new(100),
            tokens_per_call: 1,
        });
        let (ctx, _notifier) = context(launcher, Arc::clone(&platform), workroot.path(), 0);

        let report = run_item(&ctx, WorkItem::new(1, "demo")).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.phases.len(), 1);
        assert!(report.error.as_deref().unwrap().contains("3 attempt(s)"));
        assert!(ctx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_stops_the_pipeline_with_a_warning_first() {
        let workroot = tempfile::tempdir().unwrap();
        let platform = Arc::new(RecordingPlatform::new());
        let launcher = Arc::new(FlakyLauncher {
            failures: AtomicU32::new(0),
            tokens_per_call: 10,
        });
        // 10 tokens per phase, budget 25: phase 3 crosses the line.
        let (ctx, notifier) = context(launcher, platform, workroot.path(), 25);

        let report = run_item(&ctx, WorkItem::new(1, "demo")).await.unwrap();
        assert!(!report.success);
        assert!(report.error.as_deref().unwrap().contains("token budget"));
        assert!(report.phases.len() < 5);
        assert!(ctx.queue.is_empty());

        let kinds: Vec<String> = notifier.events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["budget-warning".to_string()]);
    }
}
