//! Agent-driven dependency inference.
//!
//! The resolver asks a coding agent to read the fleet's work items and emit
//! a JSON object mapping each item number to the item numbers it depends
//! on. The agent writes `dependencies.json` into a scratch directory held
//! for the whole resolution (so a retry can see what the previous attempt
//! produced). Agent failures, missing output and unparsable payloads are
//! validation failures and retried; a mapping that layers into a cycle is
//! retried once more with an explicit hint naming the entangled items.
//! Transport-level launcher errors are not retried.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::dag::IssueDag;
use crate::error::{FleetError, Result};
use crate::model::WorkItem;
use crate::traits::{AgentInvocation, AgentLauncher};

/// Appended to the prompt after a cyclic mapping, together with the items
/// the layering could not place.
const CYCLE_HINT: &str = "The previous mapping contained a dependency cycle. \
Produce an acyclic mapping: an issue may only depend on issues that can be \
completed before it.";

const OUTPUT_FILE: &str = "dependencies.json";

/// Repository coordinates included in the inference prompt.
#[derive(Debug, Clone)]
pub struct RepoContext {
    /// "owner/name" slug.
    pub repo: String,
    pub base_branch: String,
}

/// Infers the inter-item dependency graph by delegating to an agent.
pub struct DependencyResolver {
    launcher: Arc<dyn AgentLauncher>,
    max_attempts: u32,
}

impl DependencyResolver {
    pub fn new(launcher: Arc<dyn AgentLauncher>) -> Self {
        Self {
            launcher,
            max_attempts: 2,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Run the inference loop and build the DAG.
    ///
    /// Fails with [`FleetError::Agent`] on a launcher transport error and
    /// with [`FleetError::DependencyResolution`] when every attempt
    /// produced an unusable mapping.
    pub async fn resolve(&self, items: &[WorkItem], repo: &RepoContext) -> Result<IssueDag> {
        let scratch = tempfile::tempdir().map_err(|e| FleetError::DependencyResolution {
            reason: format!("could not create scratch directory: {e}"),
        })?;

        let mut cycle_hint: Option<String> = None;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let prompt = self.build_prompt(items, repo, cycle_hint.as_deref());
            let invocation = AgentInvocation {
                purpose: "dependency-inference".to_string(),
                prompt,
                output_file: Some(PathBuf::from(OUTPUT_FILE)),
            };

            info!(attempt, max_attempts = self.max_attempts, "inferring dependencies");
            let result = self
                .launcher
                .launch_agent(&invocation, scratch.path())
                .await
                .map_err(|e| FleetError::Agent {
                    reason: format!("dependency-inference launch failed: {e:#}"),
                })?;

            if !result.success {
                last_error = result
                    .error
                    .unwrap_or_else(|| format!("agent exited with code {}", result.exit_code));
                warn!(attempt, error = %last_error, "dependency inference attempt failed");
                continue;
            }
            if !result.output_exists {
                last_error = format!("agent did not write {OUTPUT_FILE}");
                warn!(attempt, error = %last_error, "dependency inference attempt failed");
                continue;
            }

            let deps = match self.read_mapping(&scratch.path().join(OUTPUT_FILE)).await {
                Ok(deps) => deps,
                Err(reason) => {
                    last_error = reason;
                    warn!(attempt, error = %last_error, "dependency payload rejected");
                    continue;
                }
            };

            match IssueDag::build(items, &deps) {
                Ok(dag) => {
                    info!(
                        items = dag.len(),
                        waves = dag.waves().len(),
                        "dependency graph resolved"
                    );
                    return Ok(dag);
                }
                Err(FleetError::CyclicDependency { items: entangled }) => {
                    last_error = format!("cyclic dependencies among items {entangled:?}");
                    warn!(attempt, error = %last_error, "mapping was cyclic, retrying with hint");
                    cycle_hint = Some(format!(
                        "{CYCLE_HINT} Items involved in the cycle: {entangled:?}."
                    ));
                }
                Err(other) => return Err(other),
            }
        }

        Err(FleetError::DependencyResolution {
            reason: format!(
                "no usable mapping after {} attempt(s): {last_error}",
                self.max_attempts
            ),
        })
    }

    fn build_prompt(&self, items: &[WorkItem], repo: &RepoContext, hint: Option<&str>) -> String {
        let mut prompt = format!(
            "Analyze the following issues from {} (base branch {}) and decide which \
             issues depend on which. Write a JSON object to {OUTPUT_FILE} mapping each \
             issue number to the array of issue numbers it depends on. Only reference \
             issues from this list. Issues:\n",
            repo.repo, repo.base_branch
        );
        for item in items {
            prompt.push_str(&format!("- #{}: {}\n", item.number, item.title));
        }
        if let Some(hint) = hint {
            prompt.push('\n');
            prompt.push_str(hint);
        }
        prompt
    }

    /// Parse the agent payload. Keys arrive as JSON strings and must be
    /// numeric item identifiers.
    async fn read_mapping(
        &self,
        path: &std::path::Path,
    ) -> std::result::Result<HashMap<u64, Vec<u64>>, String> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("could not read {OUTPUT_FILE}: {e}"))?;

        let raw: HashMap<String, Vec<u64>> = serde_json::from_str(&text)
            .map_err(|e| format!("{OUTPUT_FILE} is not a valid mapping: {e}"))?;

        let mut deps = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let number: u64 = key
                .parse()
                .map_err(|_| format!("{OUTPUT_FILE} has non-numeric key '{key}'"))?;
            deps.insert(number, value);
        }
        Ok(deps)
    }
}
