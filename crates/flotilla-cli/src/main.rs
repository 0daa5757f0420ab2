//! Flotilla - issue-fleet orchestration CLI.
//!
//! ## Commands
//!
//! - `run`: execute a fleet manifest end to end
//! - `graph`: show the dependency waves a manifest would run in
//! - `report`: summarize a previous run from its checkpoint file

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use flotilla_core::merge_queue::{CompletionOutcome, PullRequestCompletionQueue, QueueConfig};
use flotilla_core::scheduler::{BlockedMarker, FleetScheduler};
use flotilla_core::telemetry::init_tracing;
use flotilla_core::traits::{
    AgentLauncher, DependencyProbe, MergeMethod, NotificationSink, PlatformProvider,
    ProgressWriter,
};
use flotilla_core::{
    render_fleet_summary, DependencyResolver, FleetSummary, IssueDag, RepoContext, RetryPolicy,
};
use flotilla_state::{CheckpointStore, FsCheckpoint, IssueStatus, TokenTracker};

mod github;
mod launcher;
mod manifest;
mod pipeline;
mod progress;

use github::GithubProvider;
use launcher::CommandAgentLauncher;
use manifest::FleetManifest;
use pipeline::{item_processor, PipelineContext};
use progress::{JsonlProgressWriter, TracingNotifier};

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive a fleet of issues through an agent pipeline", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fleet manifest end to end
    Run {
        /// Path to the fleet manifest
        #[arg(short, long, default_value = "fleet.json")]
        manifest: PathBuf,

        /// Checkpoint file (created if missing, resumed if present)
        #[arg(long, default_value = ".flotilla/checkpoint.json")]
        checkpoint: PathBuf,

        /// Progress event log (JSON lines, appended)
        #[arg(long, default_value = ".flotilla/progress.jsonl")]
        progress: PathBuf,

        /// Root directory for per-issue working trees
        #[arg(long, default_value = ".flotilla/work")]
        workroot: PathBuf,

        /// GitHub API token
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Show the dependency waves a manifest's declared edges produce
    Graph {
        /// Path to the fleet manifest
        #[arg(short, long, default_value = "fleet.json")]
        manifest: PathBuf,
    },

    /// Summarize a previous run from its checkpoint
    Report {
        /// Checkpoint file of the run to summarize
        #[arg(long, default_value = ".flotilla/checkpoint.json")]
        checkpoint: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, cli.verbose);

    match cli.command {
        Commands::Run {
            manifest,
            checkpoint,
            progress,
            workroot,
            token,
        } => run_fleet(&manifest, checkpoint, progress, workroot, &token).await,
        Commands::Graph { manifest } => show_graph(&manifest),
        Commands::Report { checkpoint } => show_report(&checkpoint),
    }
}

async fn run_fleet(
    manifest_path: &std::path::Path,
    checkpoint_path: PathBuf,
    progress_path: PathBuf,
    workroot: PathBuf,
    token: &str,
) -> Result<()> {
    let manifest = FleetManifest::load(manifest_path)?;
    let items = manifest.work_items();
    info!(
        repo = %manifest.repo,
        items = items.len(),
        max_concurrent = manifest.max_concurrent_items,
        "starting fleet run"
    );

    let checkpoint = Arc::new(FsCheckpoint::open(&checkpoint_path)?);
    let progress = Arc::new(JsonlProgressWriter::new(&progress_path)) as Arc<dyn ProgressWriter>;
    let launcher = Arc::new(CommandAgentLauncher::new(
        manifest.agent_command.clone(),
        manifest.agent_args.clone(),
        Duration::from_secs(manifest.agent_timeout_secs),
    )) as Arc<dyn AgentLauncher>;
    let github = Arc::new(GithubProvider::new(manifest.repo.clone(), token)?);

    let dag = if manifest.resolve_dependencies {
        DependencyResolver::new(Arc::clone(&launcher))
            .resolve(
                &items,
                &RepoContext {
                    repo: manifest.repo.clone(),
                    base_branch: manifest.base_branch.clone(),
                },
            )
            .await?
    } else {
        IssueDag::build(&items, &manifest.declared_deps())?
    };
    info!(waves = dag.waves().len(), "dependency graph ready");

    let queue = Arc::new(PullRequestCompletionQueue::new(
        QueueConfig {
            enabled: manifest.auto_merge,
            base_branch: manifest.base_branch.clone(),
            merge_method: Some(MergeMethod::Squash),
        },
        Arc::clone(&github) as Arc<dyn PlatformProvider>,
        Arc::clone(&github) as Arc<dyn DependencyProbe>,
        Arc::clone(&progress),
    ));

    let ctx = Arc::new(PipelineContext {
        checkpoint: Arc::clone(&checkpoint) as Arc<dyn CheckpointStore>,
        tracker: Arc::new(TokenTracker::new()),
        notifier: Arc::new(TracingNotifier::new()) as Arc<dyn NotificationSink>,
        progress: Arc::clone(&progress),
        launcher,
        platform: Arc::clone(&github) as Arc<dyn PlatformProvider>,
        queue: Arc::clone(&queue),
        dag: dag.clone(),
        budget_tokens: manifest.budget_tokens,
        gated_phases: manifest.gated_phases.clone(),
        retry: RetryPolicy::default(),
        workroot,
    });

    let scheduler = FleetScheduler::new(
        Arc::clone(&checkpoint) as Arc<dyn CheckpointStore>,
        Arc::clone(&progress),
        manifest.max_concurrent_items,
    );
    let outcomes = scheduler
        .run(
            &dag,
            item_processor(ctx),
            Arc::clone(&github) as Arc<dyn BlockedMarker>,
        )
        .await?;

    // Let the completion queue finish, then fold its verdicts into the
    // recorded statuses.
    let completions = queue.drain().await;
    for (number, outcome) in &completions {
        let status = match outcome {
            CompletionOutcome::Merged { .. } => continue,
            CompletionOutcome::MergeFailed { .. } => IssueStatus::DepMergeConflict,
            CompletionOutcome::Blocked { .. } => IssueStatus::DepBlocked,
        };
        checkpoint.set_issue_status(*number, status).await?;
    }

    let summary = FleetSummary::from_outcomes(&outcomes, &queue.failures());
    print!("{}", render_fleet_summary(&summary, Some(dag.waves())));

    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn show_graph(manifest_path: &std::path::Path) -> Result<()> {
    let manifest = FleetManifest::load(manifest_path)?;
    let dag = IssueDag::build(&manifest.work_items(), &manifest.declared_deps())
        .context("manifest dependencies do not form a DAG")?;

    println!("Waves for {} ({} items):", manifest.repo, dag.len());
    for (index, wave) in dag.waves().iter().enumerate() {
        let entries: Vec<String> = wave
            .iter()
            .map(|n| {
                let deps = dag.direct_deps(*n);
                if deps.is_empty() {
                    format!("#{n}")
                } else {
                    format!("#{n} (after {deps:?})")
                }
            })
            .collect();
        println!("  {}: {}", index + 1, entries.join(", "));
    }
    Ok(())
}

fn show_report(checkpoint_path: &std::path::Path) -> Result<()> {
    let checkpoint = FsCheckpoint::open(checkpoint_path)?;
    let issues = checkpoint.issues();
    if issues.is_empty() {
        println!("No issues recorded in {}", checkpoint_path.display());
        return Ok(());
    }

    let mut numbers: Vec<u64> = issues.keys().copied().collect();
    numbers.sort_unstable();

    println!("Checkpoint {}:", checkpoint_path.display());
    for number in numbers {
        let record = &issues[&number];
        let status = record
            .status
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        let completed_phases = record
            .phases
            .values()
            .filter(|p| p.completed_at.is_some())
            .count();
        println!(
            "  #{number}: {status}, {completed_phases} phase(s) completed, {} tokens",
            record.total_tokens()
        );
    }

    if let Some(dag) = checkpoint.dag_record() {
        println!("  waves: {:?}", dag.waves);
    }
    Ok(())
}
