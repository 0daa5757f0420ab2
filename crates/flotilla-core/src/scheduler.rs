//! Dependency-aware fleet scheduling.
//!
//! The scheduler owns a single driver loop. Items whose dependencies are
//! all completed are spawned (bounded by a semaphore); items with a failed
//! dependency are marked blocked without ever being processed. Finished
//! tasks report back over an mpsc channel and the loop re-scans for newly
//! ready or newly blocked items, so blocking cascades through a chain in
//! the same pass. Independent fleets are just a DAG with no edges.
//!
//! Status propagation follows [`DEPENDENCY_FAILURE_STATUSES`]: a dependency
//! settled in any of those states fails its dependents. An item whose
//! direct dependency failed becomes `dep-failed`; one whose dependency was
//! itself dependency-failed becomes `dep-blocked`.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use flotilla_state::{CheckpointStore, IssueStatus};

use crate::dag::IssueDag;
use crate::error::{FleetError, Result};
use crate::model::{PhaseResult, WorkItem};
use crate::traits::ProgressWriter;

/// Dependency statuses that fail a dependent item.
pub const DEPENDENCY_FAILURE_STATUSES: [IssueStatus; 4] = [
    IssueStatus::Failed,
    IssueStatus::DepFailed,
    IssueStatus::DepBlocked,
    IssueStatus::DepMergeConflict,
];

fn is_dependency_failure(status: IssueStatus) -> bool {
    DEPENDENCY_FAILURE_STATUSES.contains(&status)
}

/// Status assigned to an item whose dependency settled in `dep_status`.
fn dependent_status(dep_status: IssueStatus) -> IssueStatus {
    match dep_status {
        IssueStatus::Failed => IssueStatus::DepFailed,
        _ => IssueStatus::DepBlocked,
    }
}

/// What the per-item pipeline reports back for one processed item.
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub number: u64,
    pub title: String,
    pub success: bool,
    pub phases: Vec<PhaseResult>,
    pub tokens_used: u64,
    pub error: Option<String>,
}

/// Terminal outcome of one item in a fleet run.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Completed(ItemReport),
    Failed(ItemReport),
    /// Never processed; a dependency settled in a failure state.
    Blocked {
        number: u64,
        title: String,
        blocked_on: u64,
        status: IssueStatus,
    },
    /// Completed in an earlier run, per the checkpoint.
    Skipped { number: u64 },
}

impl ItemOutcome {
    pub fn number(&self) -> u64 {
        match self {
            ItemOutcome::Completed(r) | ItemOutcome::Failed(r) => r.number,
            ItemOutcome::Blocked { number, .. } | ItemOutcome::Skipped { number } => *number,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Completed(_) | ItemOutcome::Skipped { .. })
    }
}

/// Side channel for telling the outside world an item was blocked, e.g. by
/// commenting on the underlying issue.
#[async_trait]
pub trait BlockedMarker: Send + Sync {
    async fn mark_blocked(&self, item: &WorkItem, blocked_on: u64, status: IssueStatus);
}

struct Settlement {
    number: u64,
    status: IssueStatus,
    outcome: ItemOutcome,
}

/// Drives a fleet of work items through the per-item pipeline.
pub struct FleetScheduler {
    checkpoint: Arc<dyn CheckpointStore>,
    progress: Arc<dyn ProgressWriter>,
    max_concurrent: usize,
}

impl FleetScheduler {
    pub fn new(
        checkpoint: Arc<dyn CheckpointStore>,
        progress: Arc<dyn ProgressWriter>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            checkpoint,
            progress,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run every item in the DAG through `process`, respecting dependency
    /// order and the concurrency cap. Returns one outcome per item, sorted
    /// by item number.
    pub async fn run<P, PFut>(
        &self,
        dag: &IssueDag,
        process: P,
        blocker: Arc<dyn BlockedMarker>,
    ) -> Result<Vec<ItemOutcome>>
    where
        P: Fn(WorkItem) -> PFut + Clone + Send + Sync + 'static,
        PFut: Future<Output = anyhow::Result<ItemReport>> + Send + 'static,
    {
        self.checkpoint.set_dag(dag.edges(), dag.waves()).await?;

        let mut pending: BTreeSet<u64> = dag.waves().iter().flatten().copied().collect();
        let mut settled: HashMap<u64, IssueStatus> = HashMap::new();
        let mut outcomes: Vec<ItemOutcome> = Vec::new();

        // Resume support: items already completed in an earlier run settle
        // immediately without being processed again.
        for number in pending.clone() {
            if self.checkpoint.is_issue_completed(number).await? {
                info!(issue = number, "already completed, skipping");
                self.progress
                    .append_event(&format!("Issue {number} already completed, skipping"))
                    .await;
                pending.remove(&number);
                settled.insert(number, IssueStatus::Completed);
                outcomes.push(ItemOutcome::Skipped { number });
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let (tx, mut rx) = mpsc::unbounded_channel::<Settlement>();
        let mut running = 0usize;

        loop {
            // Fixpoint scan: spawning or blocking one item can make the
            // next one schedulable in the same pass.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for number in pending.clone() {
                    let deps = dag.direct_deps(number);

                    let failed_dep = deps.iter().find_map(|d| {
                        settled
                            .get(d)
                            .copied()
                            .filter(|s| is_dependency_failure(*s))
                            .map(|s| (*d, s))
                    });
                    if let Some((dep, dep_status)) = failed_dep {
                        pending.remove(&number);
                        progressed = true;
                        let status = dependent_status(dep_status);
                        let outcome = self
                            .settle_blocked(dag, number, dep, status, blocker.as_ref())
                            .await?;
                        settled.insert(number, status);
                        outcomes.push(outcome);
                        continue;
                    }

                    let ready = deps
                        .iter()
                        .all(|d| settled.get(d) == Some(&IssueStatus::Completed));
                    if ready {
                        pending.remove(&number);
                        progressed = true;
                        running += 1;
                        self.spawn_item(dag, number, process.clone(), &semaphore, &tx);
                    }
                }
            }

            if running == 0 {
                if !pending.is_empty() {
                    return Err(FleetError::DependencyResolution {
                        reason: format!("items {pending:?} could not be scheduled"),
                    });
                }
                break;
            }

            let Some(settlement) = rx.recv().await else {
                break;
            };
            running -= 1;
            settled.insert(settlement.number, settlement.status);
            outcomes.push(settlement.outcome);
        }

        outcomes.sort_by_key(ItemOutcome::number);
        Ok(outcomes)
    }

    async fn settle_blocked(
        &self,
        dag: &IssueDag,
        number: u64,
        blocked_on: u64,
        status: IssueStatus,
        blocker: &dyn BlockedMarker,
    ) -> Result<ItemOutcome> {
        let title = dag
            .item(number)
            .map(|i| i.title.clone())
            .unwrap_or_default();
        warn!(issue = number, blocked_on, ?status, "blocked by dependency");
        self.progress
            .append_event(&format!("Issue {number} blocked by issue {blocked_on}"))
            .await;

        let item = WorkItem::new(number, title.clone());
        blocker.mark_blocked(&item, blocked_on, status).await;
        self.checkpoint.set_issue_status(number, status).await?;

        Ok(ItemOutcome::Blocked {
            number,
            title,
            blocked_on,
            status,
        })
    }

    fn spawn_item<P, PFut>(
        &self,
        dag: &IssueDag,
        number: u64,
        process: P,
        semaphore: &Arc<Semaphore>,
        tx: &mpsc::UnboundedSender<Settlement>,
    ) where
        P: Fn(WorkItem) -> PFut + Send + 'static,
        PFut: Future<Output = anyhow::Result<ItemReport>> + Send + 'static,
    {
        let item = dag
            .item(number)
            .cloned()
            .unwrap_or_else(|| WorkItem::new(number, String::new()));
        let checkpoint = Arc::clone(&self.checkpoint);
        let semaphore = Arc::clone(semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            if let Err(e) = checkpoint
                .set_issue_status(number, IssueStatus::InProgress)
                .await
            {
                warn!(issue = number, error = %e, "could not record in-progress status");
            }
            info!(issue = number, title = %item.title, "processing item");

            // The pipeline runs in its own task so a panic surfaces as a
            // JoinError here instead of silently dropping the settlement.
            let title = item.title.clone();
            let mut report = match tokio::spawn(process(item)).await {
                Ok(Ok(report)) => report,
                Ok(Err(e)) => ItemReport {
                    number,
                    title: title.clone(),
                    success: false,
                    phases: Vec::new(),
                    tokens_used: 0,
                    error: Some(format!("{e:#}")),
                },
                Err(e) => ItemReport {
                    number,
                    title,
                    success: false,
                    phases: Vec::new(),
                    tokens_used: 0,
                    error: Some(format!("pipeline task aborted: {e}")),
                },
            };

            let recorded = match checkpoint.issue_status(number).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(issue = number, error = %e, "could not read recorded status");
                    None
                }
            };

            // A dependency-failure status recorded by the pipeline itself,
            // e.g. an in-pipeline auto-merge conflict, overrides the
            // report: the item settles as failed and keeps that status.
            let status = match recorded.filter(|s| is_dependency_failure(*s)) {
                Some(recorded) => {
                    report.success = false;
                    if report.error.is_none() {
                        report.error =
                            Some(format!("dependency failure recorded: {recorded:?}"));
                    }
                    recorded
                }
                None => {
                    let status = if report.success {
                        IssueStatus::Completed
                    } else {
                        IssueStatus::Failed
                    };
                    if let Err(e) = checkpoint.set_issue_status(number, status).await {
                        warn!(issue = number, error = %e, "could not record terminal status");
                    }
                    status
                }
            };

            let outcome = if report.success {
                ItemOutcome::Completed(report)
            } else {
                ItemOutcome::Failed(report)
            };
            let _ = tx.send(Settlement {
                number,
                status,
                outcome,
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryProgress, RecordingBlocker};
    use flotilla_state::fakes::MemoryCheckpoint;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn items(numbers: &[u64]) -> Vec<WorkItem> {
        numbers
            .iter()
            .map(|n| WorkItem::new(*n, format!("issue {n}")))
            .collect()
    }

    fn dag(numbers: &[u64], deps: &[(u64, &[u64])]) -> IssueDag {
        let mapping: StdHashMap<u64, Vec<u64>> =
            deps.iter().map(|(n, d)| (*n, d.to_vec())).collect();
        IssueDag::build(&items(numbers), &mapping).unwrap()
    }

    fn scheduler(max_concurrent: usize) -> (FleetScheduler, Arc<MemoryCheckpoint>) {
        let checkpoint = Arc::new(MemoryCheckpoint::new());
        let sched = FleetScheduler::new(
            Arc::clone(&checkpoint) as Arc<dyn CheckpointStore>,
            Arc::new(MemoryProgress::new()),
            max_concurrent,
        );
        (sched, checkpoint)
    }

    fn report(item: &WorkItem, success: bool) -> ItemReport {
        ItemReport {
            number: item.number,
            title: item.title.clone(),
            success,
            phases: Vec::new(),
            tokens_used: 0,
            error: if success { None } else { Some("pipeline failed".to_string()) },
        }
    }

    #[tokio::test]
    async fn test_failed_root_blocks_all_dependents_without_processing_them() {
        let (sched, checkpoint) = scheduler(4);
        let blocker = Arc::new(RecordingBlocker::new());
        let processed = Arc::new(Mutex::new(Vec::new()));

        let processed_in = Arc::clone(&processed);
        let outcomes = sched
            .run(
                &dag(&[1, 2, 3], &[(2, &[1]), (3, &[1])]),
                move |item: WorkItem| {
                    let processed = Arc::clone(&processed_in);
                    async move {
                        processed.lock().unwrap().push(item.number);
                        Ok(report(&item, false))
                    }
                },
                Arc::clone(&blocker) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        // Only the root was ever processed.
        assert_eq!(&*processed.lock().unwrap(), &[1]);
        assert_eq!(blocker.calls().len(), 2);

        assert!(matches!(outcomes[0], ItemOutcome::Failed(_)));
        for outcome in &outcomes[1..] {
            assert!(matches!(
                outcome,
                ItemOutcome::Blocked { blocked_on: 1, status: IssueStatus::DepFailed, .. }
            ));
        }
        assert_eq!(checkpoint.status(2), Some(IssueStatus::DepFailed));
        assert_eq!(checkpoint.status(3), Some(IssueStatus::DepFailed));
    }

    #[tokio::test]
    async fn test_blocking_cascades_down_a_chain() {
        let (sched, checkpoint) = scheduler(4);
        let blocker = Arc::new(RecordingBlocker::new());

        let outcomes = sched
            .run(
                &dag(&[1, 2, 3], &[(2, &[1]), (3, &[2])]),
                move |item: WorkItem| async move { Ok(report(&item, false)) },
                Arc::clone(&blocker) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        assert!(matches!(outcomes[0], ItemOutcome::Failed(_)));
        // 2's dependency failed outright; 3's dependency was itself blocked.
        assert_eq!(checkpoint.status(2), Some(IssueStatus::DepFailed));
        assert_eq!(checkpoint.status(3), Some(IssueStatus::DepBlocked));
    }

    #[tokio::test]
    async fn test_dependency_order_is_respected() {
        let (sched, _checkpoint) = scheduler(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_in = Arc::clone(&order);
        let outcomes = sched
            .run(
                &dag(&[1, 2, 3, 4], &[(2, &[1]), (3, &[1]), (4, &[2, 3])]),
                move |item: WorkItem| {
                    let order = Arc::clone(&order_in);
                    async move {
                        order.lock().unwrap().push(item.number);
                        Ok(report(&item, true))
                    }
                },
                Arc::new(RecordingBlocker::new()) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        assert!(outcomes.iter().all(ItemOutcome::is_success));
        let order = order.lock().unwrap().clone();
        let position = |n: u64| order.iter().position(|&x| x == n).unwrap();
        assert!(position(1) < position(2));
        assert!(position(1) < position(3));
        assert!(position(4) > position(2) && position(4) > position(3));
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_enforced() {
        let (sched, _checkpoint) = scheduler(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let in_flight_in = Arc::clone(&in_flight);
        let peak_in = Arc::clone(&peak);
        sched
            .run(
                &dag(&[1, 2, 3, 4, 5], &[]),
                move |item: WorkItem| {
                    let in_flight = Arc::clone(&in_flight_in);
                    let peak = Arc::clone(&peak_in);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(report(&item, true))
                    }
                },
                Arc::new(RecordingBlocker::new()) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_previously_completed_item_is_skipped_and_unblocks_dependents() {
        let (sched, checkpoint) = scheduler(4);
        checkpoint
            .set_issue_status(1, IssueStatus::Completed)
            .await
            .unwrap();

        let processed = Arc::new(Mutex::new(Vec::new()));
        let processed_in = Arc::clone(&processed);
        let outcomes = sched
            .run(
                &dag(&[1, 2], &[(2, &[1])]),
                move |item: WorkItem| {
                    let processed = Arc::clone(&processed_in);
                    async move {
                        processed.lock().unwrap().push(item.number);
                        Ok(report(&item, true))
                    }
                },
                Arc::new(RecordingBlocker::new()) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        assert_eq!(&*processed.lock().unwrap(), &[2]);
        assert!(matches!(outcomes[0], ItemOutcome::Skipped { number: 1 }));
        assert!(matches!(outcomes[1], ItemOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_process_error_counts_as_failure() {
        let (sched, checkpoint) = scheduler(1);

        let outcomes = sched
            .run(
                &dag(&[1], &[]),
                move |_item: WorkItem| async move { anyhow::bail!("pipeline panicked") },
                Arc::new(RecordingBlocker::new()) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        match &outcomes[0] {
            ItemOutcome::Failed(report) => {
                assert!(report.error.as_deref().unwrap().contains("pipeline panicked"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(checkpoint.status(1), Some(IssueStatus::Failed));
    }

    #[tokio::test]
    async fn test_recorded_dep_failure_status_overrides_success_report() {
        let (sched, checkpoint) = scheduler(2);
        let blocker = Arc::new(RecordingBlocker::new());

        let checkpoint_in = Arc::clone(&checkpoint);
        let outcomes = sched
            .run(
                &dag(&[1, 2], &[(2, &[1])]),
                move |item: WorkItem| {
                    let checkpoint = Arc::clone(&checkpoint_in);
                    async move {
                        // An in-pipeline auto-merge conflict records the
                        // status even though every phase passed.
                        checkpoint
                            .set_issue_status(item.number, IssueStatus::DepMergeConflict)
                            .await?;
                        Ok(report(&item, true))
                    }
                },
                Arc::clone(&blocker) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        match &outcomes[0] {
            ItemOutcome::Failed(r) => assert!(!r.success),
            other => panic!("expected Failed, got {other:?}"),
        }
        // The recorded status survives; it is not overwritten with Failed.
        assert_eq!(checkpoint.status(1), Some(IssueStatus::DepMergeConflict));
        assert!(matches!(
            outcomes[1],
            ItemOutcome::Blocked { blocked_on: 1, status: IssueStatus::DepBlocked, .. }
        ));
    }

    #[tokio::test]
    async fn test_panicking_pipeline_settles_as_failure() {
        let (sched, checkpoint) = scheduler(2);

        let outcomes = sched
            .run(
                &dag(&[1, 2], &[(2, &[1])]),
                move |item: WorkItem| async move {
                    if item.number == 1 {
                        panic!("agent pipeline crashed");
                    }
                    Ok(report(&item, true))
                },
                Arc::new(RecordingBlocker::new()) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        match &outcomes[0] {
            ItemOutcome::Failed(r) => {
                assert!(r.error.as_deref().unwrap().contains("panicked"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(checkpoint.status(1), Some(IssueStatus::Failed));
        assert!(matches!(
            outcomes[1],
            ItemOutcome::Blocked { blocked_on: 1, status: IssueStatus::DepFailed, .. }
        ));
    }

    #[tokio::test]
    async fn test_dag_metadata_is_recorded_for_reporting() {
        let (sched, checkpoint) = scheduler(4);
        sched
            .run(
                &dag(&[1, 2], &[(2, &[1])]),
                move |item: WorkItem| async move { Ok(report(&item, true)) },
                Arc::new(RecordingBlocker::new()) as Arc<dyn BlockedMarker>,
            )
            .await
            .unwrap();

        let record = checkpoint.dag().unwrap();
        assert_eq!(record.waves, vec![vec![1], vec![2]]);
        assert_eq!(record.edges[&2], vec![1]);
    }
}
