//! In-memory fakes for the collaborator traits (testing only).
//!
//! Recording implementations of the fire-and-forget sinks plus a scriptable
//! platform provider, reused by unit tests here and by the integration
//! suite under `tests/`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use flotilla_state::IssueStatus;

use crate::model::{Notification, WorkItem};
use crate::scheduler::BlockedMarker;
use crate::traits::{
    DependencyProbe, MergeMethod, NotificationSink, PlatformProvider, PrFilter, ProgressWriter,
    PullRequest,
};

/// Notification sink that records every dispatched event.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn dispatch(&self, event: Notification) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Progress writer that accumulates event lines in memory.
#[derive(Debug, Default)]
pub struct MemoryProgress {
    lines: Mutex<Vec<String>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ProgressWriter for MemoryProgress {
    async fn append_event(&self, text: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }
}

/// Scriptable platform provider: merges succeed unless the PR number is in
/// the failure set; every merge call is recorded.
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    merged: Mutex<Vec<u64>>,
    fail_merges_for: Mutex<HashSet<u64>>,
    pull_requests: Mutex<Vec<PullRequest>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make merges of this PR number fail.
    pub fn fail_merge(&self, pr_number: u64) {
        self.fail_merges_for
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pr_number);
    }

    /// Seed the PR listing.
    pub fn add_pull_request(&self, pr: PullRequest) {
        self.pull_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pr);
    }

    /// PR numbers merged so far, in call order.
    pub fn merged(&self) -> Vec<u64> {
        self.merged.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PlatformProvider for RecordingPlatform {
    async fn merge_pull_request(
        &self,
        pr_number: u64,
        _base_branch: &str,
        _method: Option<MergeMethod>,
    ) -> anyhow::Result<()> {
        let failing = self
            .fail_merges_for
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pr_number);
        if failing {
            anyhow::bail!("merge of PR #{pr_number} rejected by platform");
        }
        self.merged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pr_number);
        Ok(())
    }

    async fn list_pull_requests(&self, filter: &PrFilter) -> anyhow::Result<Vec<PullRequest>> {
        let prs = self.pull_requests.lock().unwrap_or_else(|e| e.into_inner());
        Ok(prs
            .iter()
            .filter(|pr| {
                filter.state.as_deref().map_or(true, |s| pr.state == s)
                    && filter
                        .head_prefix
                        .as_deref()
                        .map_or(true, |p| pr.head_branch.starts_with(p))
            })
            .cloned()
            .collect())
    }
}

/// Blocked marker recording every call.
#[derive(Debug, Default)]
pub struct RecordingBlocker {
    calls: Mutex<Vec<(u64, u64, IssueStatus)>>,
}

impl RecordingBlocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(item, blocked_on, status)` tuples in call order.
    pub fn calls(&self) -> Vec<(u64, u64, IssueStatus)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl BlockedMarker for RecordingBlocker {
    async fn mark_blocked(&self, item: &WorkItem, blocked_on: u64, status: IssueStatus) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((item.number, blocked_on, status));
    }
}

/// Dependency probe answering from a fixed table; unknown issues are
/// unsatisfied.
#[derive(Debug, Default)]
pub struct StaticProbe {
    satisfied: Mutex<HashMap<u64, bool>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, issue: u64, satisfied: bool) {
        self.satisfied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(issue, satisfied);
    }
}

#[async_trait]
impl DependencyProbe for StaticProbe {
    async fn is_satisfied(&self, issue: u64) -> anyhow::Result<bool> {
        Ok(self
            .satisfied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&issue)
            .copied()
            .unwrap_or(false))
    }
}
