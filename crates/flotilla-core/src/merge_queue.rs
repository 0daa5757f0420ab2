//! Asynchronous pull-request completion queue.
//!
//! Every enqueued item gets exactly one completion execution, memoized as a
//! shared future keyed by item number. An item's execution first awaits the
//! executions of the items it depends on (or asks the dependency probe when
//! a dependency was never enqueued, e.g. because it was merged in an
//! earlier run), then merges the item's PR under a one-permit semaphore so
//! merges into the base branch are serialized. A dependency that did not
//! end in a merge blocks the dependent; the dependent's PR is left open for
//! manual resolution.
//!
//! No lock is ever held across an await: shared futures are cloned out
//! under the state lock and awaited outside it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::QueueItem;
use crate::traits::{DependencyProbe, MergeMethod, PlatformProvider, ProgressWriter};

/// How one item's completion ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The item's PR was merged.
    Merged { pr_number: u64 },
    /// A dependency did not end in a merge; this item's PR stays open.
    Blocked { dependency: u64, reason: String },
    /// The platform rejected the merge.
    MergeFailed { pr_number: u64, reason: String },
}

impl CompletionOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, CompletionOutcome::Merged { .. })
    }
}

/// Queue configuration carried by the fleet run.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// When false the queue accepts nothing; PRs stay open.
    pub enabled: bool,
    pub base_branch: String,
    pub merge_method: Option<MergeMethod>,
}

type CompletionFuture = Shared<BoxFuture<'static, CompletionOutcome>>;

#[derive(Default)]
struct QueueState {
    /// PR numbers ever enqueued; the dedup key.
    queued_prs: HashSet<u64>,
    /// Memoized execution per item number.
    executions: HashMap<u64, CompletionFuture>,
    /// Driver tasks, reaped by `drain`.
    handles: Vec<JoinHandle<()>>,
    /// Item number to failure reason, for reporting.
    failures: HashMap<u64, String>,
}

struct QueueInner {
    config: QueueConfig,
    platform: Arc<dyn PlatformProvider>,
    probe: Arc<dyn DependencyProbe>,
    progress: Arc<dyn ProgressWriter>,
    merges: Semaphore,
    state: Mutex<QueueState>,
}

/// Completion queue for one fleet run.
pub struct PullRequestCompletionQueue {
    inner: Arc<QueueInner>,
}

impl PullRequestCompletionQueue {
    pub fn new(
        config: QueueConfig,
        platform: Arc<dyn PlatformProvider>,
        probe: Arc<dyn DependencyProbe>,
        progress: Arc<dyn ProgressWriter>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                platform,
                probe,
                progress,
                merges: Semaphore::new(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Enqueue an item for completion. Returns false when the queue is
    /// disabled or the item's PR is already queued.
    pub fn enqueue(&self, item: QueueItem) -> bool {
        if !self.inner.config.enabled {
            debug!(issue = item.number, pr = item.pr_number, "queue disabled, leaving PR open");
            return false;
        }

        let future = {
            let mut state = self.inner.lock_state();
            if !state.queued_prs.insert(item.pr_number) {
                debug!(issue = item.number, pr = item.pr_number, "PR already queued");
                return false;
            }
            info!(issue = item.number, pr = item.pr_number, "queued for completion");
            let future = QueueInner::execute_item(Arc::clone(&self.inner), item.clone())
                .boxed()
                .shared();
            state.executions.insert(item.number, future.clone());
            future
        };

        let handle = tokio::spawn(async move {
            future.await;
        });
        self.inner.lock_state().handles.push(handle);
        true
    }

    /// Await every queued execution, including ones enqueued while the
    /// drain is in progress. Returns the outcomes sorted by item number.
    pub async fn drain(&self) -> Vec<(u64, CompletionOutcome)> {
        loop {
            let (executions, handles) = {
                let mut state = self.inner.lock_state();
                (
                    state.executions.clone(),
                    std::mem::take(&mut state.handles),
                )
            };
            for handle in handles {
                let _ = handle.await;
            }
            futures::future::join_all(executions.values().cloned()).await;

            // Re-check: a dependent settled during the wait may have
            // enqueued more work.
            if self.inner.lock_state().executions.len() == executions.len() {
                let mut outcomes = Vec::with_capacity(executions.len());
                for (number, execution) in executions {
                    outcomes.push((number, execution.await));
                }
                outcomes.sort_by_key(|(number, _)| *number);
                return outcomes;
            }
        }
    }

    /// Failure reasons recorded so far, keyed by item number.
    pub fn failures(&self) -> HashMap<u64, String> {
        self.inner.lock_state().failures.clone()
    }

    /// Number of items queued so far.
    pub fn len(&self) -> usize {
        self.inner.lock_state().executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_failure(&self, issue: u64, reason: &str) {
        self.lock_state().failures.insert(issue, reason.to_string());
    }

    async fn execute_item(inner: Arc<QueueInner>, item: QueueItem) -> CompletionOutcome {
        for dep in item.depends_on.iter().copied().filter(|d| *d != item.number) {
            let pending = inner.lock_state().executions.get(&dep).cloned();
            let satisfied = match pending {
                Some(execution) => execution.await.is_merged(),
                // Not queued in this run: it may have been merged before
                // the run started.
                None => match inner.probe.is_satisfied(dep).await {
                    Ok(satisfied) => satisfied,
                    Err(e) => {
                        warn!(issue = item.number, dep, error = %format!("{e:#}"), "dependency probe failed");
                        false
                    }
                },
            };

            if !satisfied {
                let reason = format!("Blocked by unresolved dependency {dep}");
                warn!(issue = item.number, dep, "completion blocked");
                inner.record_failure(item.number, &reason);
                inner
                    .progress
                    .append_event(&format!(
                        "Issue {} left open: {reason} (PR #{})",
                        item.number, item.pr_number
                    ))
                    .await;
                return CompletionOutcome::Blocked {
                    dependency: dep,
                    reason,
                };
            }
        }

        let _permit = match inner.merges.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let reason = "merge queue shut down".to_string();
                inner.record_failure(item.number, &reason);
                return CompletionOutcome::MergeFailed {
                    pr_number: item.pr_number,
                    reason,
                };
            }
        };

        match inner
            .platform
            .merge_pull_request(item.pr_number, &inner.config.base_branch, inner.config.merge_method)
            .await
        {
            Ok(()) => {
                info!(issue = item.number, pr = item.pr_number, "PR merged");
                inner
                    .progress
                    .append_event(&format!(
                        "Merged PR #{} for issue {}",
                        item.pr_number, item.number
                    ))
                    .await;
                CompletionOutcome::Merged {
                    pr_number: item.pr_number,
                }
            }
            Err(e) => {
                let reason = format!("merge of PR #{} failed: {e:#}", item.pr_number);
                warn!(issue = item.number, pr = item.pr_number, error = %reason, "merge failed");
                inner.record_failure(item.number, &reason);
                inner
                    .progress
                    .append_event(&format!("Issue {}: {reason}", item.number))
                    .await;
                CompletionOutcome::MergeFailed {
                    pr_number: item.pr_number,
                    reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryProgress, RecordingPlatform, StaticProbe};

    fn queue(
        enabled: bool,
    ) -> (
        PullRequestCompletionQueue,
        Arc<RecordingPlatform>,
        Arc<StaticProbe>,
    ) {
        let platform = Arc::new(RecordingPlatform::new());
        let probe = Arc::new(StaticProbe::new());
        let q = PullRequestCompletionQueue::new(
            QueueConfig {
                enabled,
                base_branch: "main".to_string(),
                merge_method: Some(MergeMethod::Squash),
            },
            Arc::clone(&platform) as Arc<dyn PlatformProvider>,
            Arc::clone(&probe) as Arc<dyn DependencyProbe>,
            Arc::new(MemoryProgress::new()),
        );
        (q, platform, probe)
    }

    fn item(number: u64, pr_number: u64, depends_on: &[u64]) -> QueueItem {
        QueueItem {
            number,
            title: format!("issue {number}"),
            pr_number,
            pr_url: format!("https://example.test/pull/{pr_number}"),
            branch: format!("issue-{number}"),
            depends_on: depends_on.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_independent_item_merges() {
        let (queue, platform, _probe) = queue(true);
        assert!(queue.enqueue(item(1, 101, &[])));

        let outcomes = queue.drain().await;
        assert_eq!(outcomes, vec![(1, CompletionOutcome::Merged { pr_number: 101 })]);
        assert_eq!(platform.merged(), vec![101]);
    }

    #[tokio::test]
    async fn test_duplicate_pr_is_enqueued_once() {
        let (queue, platform, _probe) = queue(true);
        assert!(queue.enqueue(item(1, 101, &[])));
        assert!(!queue.enqueue(item(1, 101, &[])));

        queue.drain().await;
        assert_eq!(platform.merged(), vec![101]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependency_merge() {
        let (queue, platform, _probe) = queue(true);
        queue.enqueue(item(1, 101, &[]));
        queue.enqueue(item(2, 102, &[1]));

        let outcomes = queue.drain().await;
        assert!(outcomes.iter().all(|(_, o)| o.is_merged()));
        // Dependency merges strictly before the dependent.
        assert_eq!(platform.merged(), vec![101, 102]);
    }

    #[tokio::test]
    async fn test_failed_dependency_merge_blocks_dependent() {
        let (queue, platform, _probe) = queue(true);
        platform.fail_merge(101);
        queue.enqueue(item(1, 101, &[]));
        queue.enqueue(item(2, 102, &[1]));

        let outcomes = queue.drain().await;
        assert!(matches!(
            outcomes[0].1,
            CompletionOutcome::MergeFailed { pr_number: 101, .. }
        ));
        match &outcomes[1].1 {
            CompletionOutcome::Blocked { dependency, reason } => {
                assert_eq!(*dependency, 1);
                assert!(reason.contains("Blocked by unresolved dependency 1"));
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
        // The dependent's PR is never touched.
        assert!(platform.merged().is_empty());
        assert!(queue.failures().contains_key(&2));
    }

    #[tokio::test]
    async fn test_dependent_enqueued_before_failing_dependency_is_blocked() {
        let (queue, platform, _probe) = queue(true);
        platform.fail_merge(101);

        // Dependent first: its dependency lookup may run before the
        // dependency is queued and fall back to the unsatisfied probe, or
        // find the execution and await its failed merge. Both block it.
        queue.enqueue(item(2, 102, &[1]));
        tokio::task::yield_now().await;
        queue.enqueue(item(1, 101, &[]));

        let outcomes = queue.drain().await;
        match &outcomes[1].1 {
            CompletionOutcome::Blocked { dependency, reason } => {
                assert_eq!(*dependency, 1);
                assert!(reason.contains("Blocked by unresolved dependency 1"));
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
        // The dependent's PR is never merged.
        assert!(platform.merged().is_empty());
        assert!(queue.failures().contains_key(&2));
    }

    #[tokio::test]
    async fn test_dependency_never_enqueued_falls_back_to_probe() {
        let (queue, platform, probe) = queue(true);
        probe.set(7, true);
        queue.enqueue(item(2, 102, &[7]));

        let outcomes = queue.drain().await;
        assert!(outcomes[0].1.is_merged());
        assert_eq!(platform.merged(), vec![102]);
    }

    #[tokio::test]
    async fn test_unsatisfied_probe_blocks_without_merging() {
        let (queue, platform, probe) = queue(true);
        probe.set(7, false);
        queue.enqueue(item(2, 102, &[7]));

        let outcomes = queue.drain().await;
        assert!(matches!(outcomes[0].1, CompletionOutcome::Blocked { dependency: 7, .. }));
        assert!(platform.merged().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_queue_accepts_nothing() {
        let (queue, platform, _probe) = queue(false);
        assert!(!queue.enqueue(item(1, 101, &[])));

        let outcomes = queue.drain().await;
        assert!(outcomes.is_empty());
        assert!(platform.merged().is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_self_dependency_is_ignored() {
        let (queue, platform, _probe) = queue(true);
        queue.enqueue(item(1, 101, &[1]));

        let outcomes = queue.drain().await;
        assert!(outcomes[0].1.is_merged());
        assert_eq!(platform.merged(), vec![101]);
    }

    #[tokio::test]
    async fn test_diamond_dependency_merges_each_pr_once() {
        // 4 depends on 2 and 3, both depending on 1.
        let (queue, platform, _probe) = queue(true);
        queue.enqueue(item(1, 101, &[]));
        queue.enqueue(item(2, 102, &[1]));
        queue.enqueue(item(3, 103, &[1]));
        queue.enqueue(item(4, 104, &[2, 3]));

        let outcomes = queue.drain().await;
        assert!(outcomes.iter().all(|(_, o)| o.is_merged()));

        let merged = platform.merged();
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0], 101);
        assert_eq!(merged[3], 104);
    }
}
