//! Collaborator interfaces consumed by the orchestration engine.
//!
//! Everything the engine talks to outside its own process (agent
//! processes, the PR platform, notification transports, progress logs)
//! sits behind one of these named traits. Inject real adapters from the
//! CLI crate, or stubs for tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{GateResult, Notification, Phase};

/// Context handed to a phase executor and its gate validators.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub issue: u64,
    pub title: String,
    pub phase: Phase,
    /// Working tree the phase's agent operates in.
    pub workdir: PathBuf,
    /// 1 for the first execution, 2 for the single gate-triggered retry.
    pub attempt: u32,
}

/// Context handed to gate validators after a phase produced output.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub issue: u64,
    pub phase: Phase,
    /// The artifact the phase produced.
    pub output: Option<PathBuf>,
    pub workdir: PathBuf,
}

/// Executes one pipeline phase and returns the produced artifact path.
///
/// A `FleetError::BudgetExceeded` inside the returned error chain is
/// propagated unwrapped by the phase runner; any other failure becomes a
/// failed `PhaseResult`.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &PhaseContext) -> anyhow::Result<PathBuf>;
}

/// A quality gate run against a phase's output.
#[async_trait]
pub trait GateValidator: Send + Sync {
    /// Stable validator name, used in progress events and logs.
    fn name(&self) -> &str;

    async fn validate(&self, ctx: &GateContext) -> anyhow::Result<GateResult>;
}

/// One request to launch an external coding agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    /// Short label for logs ("dependency-inference", "phase-3", ...).
    pub purpose: String,
    /// The prompt or task description handed to the agent.
    pub prompt: String,
    /// File (relative to the working directory) the agent must write its
    /// structured output to, when one is expected.
    pub output_file: Option<PathBuf>,
}

/// Token usage reported by an agent invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentTokenUsage {
    pub input: u64,
    pub output: u64,
}

/// Outcome of one agent process run. Agent-side failures (non-zero exit,
/// timeout, missing output) surface here as ordinary failed results; only
/// transport-level problems are errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub exit_code: i32,
    pub timed_out: bool,
    /// Whether the invocation's `output_file` exists after the run.
    pub output_exists: bool,
    pub token_usage: Option<AgentTokenUsage>,
    pub error: Option<String>,
}

/// Spawns and supervises external coding-agent processes.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch_agent(
        &self,
        invocation: &AgentInvocation,
        workdir: &Path,
    ) -> anyhow::Result<AgentResult>;
}

/// Fire-and-forget notification dispatch. Implementations must swallow and
/// log their own failures; nothing here may propagate into the caller.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, event: Notification);
}

/// Appends human-readable progress events. Fire-and-forget, like
/// [`NotificationSink`].
#[async_trait]
pub trait ProgressWriter: Send + Sync {
    async fn append_event(&self, text: &str);
}

/// PR merge method, where the platform supports a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

/// A pull request as seen through the platform abstraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
    pub state: String,
    pub merged: bool,
}

/// Filter for listing pull requests.
#[derive(Debug, Clone, Default)]
pub struct PrFilter {
    /// "open", "closed" or None for all.
    pub state: Option<String>,
    /// Restrict to head branches starting with this prefix.
    pub head_prefix: Option<String>,
}

/// The issue-tracking / PR platform (GitHub, Azure DevOps, ...).
#[async_trait]
pub trait PlatformProvider: Send + Sync {
    async fn merge_pull_request(
        &self,
        pr_number: u64,
        base_branch: &str,
        method: Option<MergeMethod>,
    ) -> anyhow::Result<()>;

    async fn list_pull_requests(&self, filter: &PrFilter) -> anyhow::Result<Vec<PullRequest>>;
}

/// Answers "is this dependency already satisfied outside the completion
/// queue?", typically "is that item's PR merged on the platform?".
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    async fn is_satisfied(&self, issue: u64) -> anyhow::Result<bool>;
}
