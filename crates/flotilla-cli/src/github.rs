//! GitHub adapter: PR platform, dependency probe and blocked-marker.
//!
//! One provider instance serves all three seams the engine needs from the
//! platform. The dependency probe treats a closed issue as a satisfied
//! dependency (its PR was merged in an earlier run, or a human resolved it
//! by hand). Blocked markers become issue comments and never fail the run.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use flotilla_core::scheduler::BlockedMarker;
use flotilla_core::traits::{
    DependencyProbe, MergeMethod, PlatformProvider, PrFilter, PullRequest,
};
use flotilla_core::WorkItem;
use flotilla_state::IssueStatus;

const DEFAULT_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct ApiHead {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    number: u64,
    html_url: String,
    state: String,
    merged_at: Option<String>,
    head: ApiHead,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
    state: String,
}

fn merge_method_str(method: Option<MergeMethod>) -> &'static str {
    match method {
        Some(MergeMethod::Merge) => "merge",
        Some(MergeMethod::Rebase) => "rebase",
        Some(MergeMethod::Squash) | None => "squash",
    }
}

/// GitHub REST client scoped to one repository.
pub struct GithubProvider {
    client: reqwest::Client,
    api_base: String,
    repo: String,
}

impl GithubProvider {
    pub fn new(repo: impl Into<String>, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("GitHub token contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("flotilla"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("could not build GitHub HTTP client")?;

        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            repo: repo.into(),
        })
    }

    /// Point at a different API root (GitHub Enterprise, test server).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/{path}", self.api_base, self.repo)
    }
}

#[async_trait]
impl PlatformProvider for GithubProvider {
    async fn merge_pull_request(
        &self,
        pr_number: u64,
        base_branch: &str,
        method: Option<MergeMethod>,
    ) -> Result<()> {
        debug!(pr = pr_number, base = base_branch, "merging pull request");
        let response = self
            .client
            .put(self.url(&format!("pulls/{pr_number}/merge")))
            .json(&json!({ "merge_method": merge_method_str(method) }))
            .send()
            .await
            .with_context(|| format!("merge request for PR #{pr_number} failed to send"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GitHub refused to merge PR #{pr_number}: {status}: {body}");
        }
        Ok(())
    }

    async fn list_pull_requests(&self, filter: &PrFilter) -> Result<Vec<PullRequest>> {
        let state = filter.state.as_deref().unwrap_or("all");
        let response = self
            .client
            .get(self.url("pulls"))
            .query(&[("state", state), ("per_page", "100")])
            .send()
            .await
            .context("pull request listing failed to send")?
            .error_for_status()
            .context("pull request listing was rejected")?;

        let pulls: Vec<ApiPull> = response
            .json()
            .await
            .context("pull request listing returned unexpected JSON")?;

        Ok(pulls
            .into_iter()
            .filter(|p| {
                filter
                    .head_prefix
                    .as_deref()
                    .map_or(true, |prefix| p.head.branch.starts_with(prefix))
            })
            .map(|p| PullRequest {
                number: p.number,
                url: p.html_url,
                head_branch: p.head.branch,
                merged: p.merged_at.is_some(),
                state: p.state,
            })
            .collect())
    }
}

#[async_trait]
impl DependencyProbe for GithubProvider {
    async fn is_satisfied(&self, issue: u64) -> Result<bool> {
        let response = self
            .client
            .get(self.url(&format!("issues/{issue}")))
            .send()
            .await
            .with_context(|| format!("could not fetch issue #{issue}"))?
            .error_for_status()
            .with_context(|| format!("issue #{issue} lookup was rejected"))?;

        let api_issue: ApiIssue = response
            .json()
            .await
            .with_context(|| format!("issue #{issue} returned unexpected JSON"))?;
        Ok(api_issue.state == "closed")
    }
}

#[async_trait]
impl BlockedMarker for GithubProvider {
    async fn mark_blocked(&self, item: &WorkItem, blocked_on: u64, status: IssueStatus) {
        let label = match status {
            IssueStatus::DepFailed => "a failed dependency",
            IssueStatus::DepMergeConflict => "a dependency whose PR could not be merged",
            _ => "a blocked dependency",
        };
        let body = format!(
            "This issue was not processed: it depends on #{blocked_on}, which ended as {label}. \
             Re-run the fleet once #{blocked_on} is resolved."
        );

        let result = self
            .client
            .post(self.url(&format!("issues/{}/comments", item.number)))
            .json(&json!({ "body": body }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(issue = item.number, status = %response.status(), "blocked comment rejected");
            }
            Err(e) => {
                warn!(issue = item.number, error = %e, "blocked comment failed");
            }
        }
    }
}
