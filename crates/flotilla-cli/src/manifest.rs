//! Fleet manifest: the JSON file describing one run.
//!
//! A manifest names the repository, the work items, and the knobs of the
//! run (budget, concurrency, gating, auto-merge). Dependencies can be
//! declared inline per item or inferred by an agent when
//! `resolve_dependencies` is set.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use flotilla_core::WorkItem;

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_gated_phases() -> Vec<u32> {
    vec![3, 4]
}

fn default_agent_timeout() -> u64 {
    1_800
}

/// One work item as declared in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    pub number: u64,
    pub title: String,
    /// Declared dependencies; ignored when `resolve_dependencies` is set.
    #[serde(default)]
    pub depends_on: Vec<u64>,
}

/// Run description loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetManifest {
    /// "owner/name" repository slug.
    pub repo: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    pub items: Vec<ManifestItem>,

    /// Per-item token budget; 0 means unlimited.
    #[serde(default)]
    pub budget_tokens: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_items: usize,

    /// Program invoked as the coding agent; receives the prompt as its
    /// last argument.
    pub agent_command: String,
    #[serde(default)]
    pub agent_args: Vec<String>,
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,

    /// Infer the dependency graph with an agent instead of using the
    /// items' `depends_on` declarations.
    #[serde(default)]
    pub resolve_dependencies: bool,
    /// Merge finished PRs through the completion queue.
    #[serde(default)]
    pub auto_merge: bool,
    /// Phase numbers whose output goes through a quality gate.
    #[serde(default = "default_gated_phases")]
    pub gated_phases: Vec<u32>,
}

impl FleetManifest {
    /// Load and validate a manifest from a JSON file.
    pub fn load(path: &Path) -> Result<FleetManifest> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read manifest {}", path.display()))?;
        let manifest: FleetManifest = serde_json::from_str(&raw)
            .with_context(|| format!("manifest {} is not valid JSON", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.repo.split('/').count() != 2 {
            bail!("repo must be an owner/name slug, got '{}'", self.repo);
        }
        if self.items.is_empty() {
            bail!("manifest contains no items");
        }
        let mut seen = std::collections::HashSet::new();
        for item in &self.items {
            if !seen.insert(item.number) {
                bail!("duplicate item number {} in manifest", item.number);
            }
        }
        for phase in &self.gated_phases {
            if !(1..=5).contains(phase) {
                bail!("gated phase {phase} is outside the 1..=5 pipeline");
            }
        }
        Ok(())
    }

    /// The manifest's items as engine work items.
    pub fn work_items(&self) -> Vec<WorkItem> {
        self.items
            .iter()
            .map(|i| WorkItem::new(i.number, i.title.clone()))
            .collect()
    }

    /// The declared dependency mapping.
    pub fn declared_deps(&self) -> HashMap<u64, Vec<u64>> {
        self.items
            .iter()
            .map(|i| (i.number, i.depends_on.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(json: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        std::fs::write(&path, json).unwrap();
        (dir, path)
    }

    #[test]
    fn test_minimal_manifest_gets_defaults() {
        let (_dir, path) = write_manifest(
            r#"{
                "repo": "acme/widgets",
                "agent_command": "agent",
                "items": [{"number": 1, "title": "first"}]
            }"#,
        );
        let manifest = FleetManifest::load(&path).unwrap();
        assert_eq!(manifest.base_branch, "main");
        assert_eq!(manifest.max_concurrent_items, 3);
        assert_eq!(manifest.budget_tokens, 0);
        assert_eq!(manifest.gated_phases, vec![3, 4]);
        assert_eq!(manifest.agent_timeout_secs, 1_800);
        assert!(!manifest.resolve_dependencies);
        assert!(!manifest.auto_merge);
    }

    #[test]
    fn test_declared_deps_round_trip() {
        let (_dir, path) = write_manifest(
            r#"{
                "repo": "acme/widgets",
                "agent_command": "agent",
                "items": [
                    {"number": 1, "title": "first"},
                    {"number": 2, "title": "second", "depends_on": [1]}
                ]
            }"#,
        );
        let manifest = FleetManifest::load(&path).unwrap();
        assert_eq!(manifest.work_items().len(), 2);
        assert_eq!(manifest.declared_deps()[&2], vec![1]);
    }

    #[test]
    fn test_duplicate_item_numbers_are_rejected() {
        let (_dir, path) = write_manifest(
            r#"{
                "repo": "acme/widgets",
                "agent_command": "agent",
                "items": [
                    {"number": 1, "title": "first"},
                    {"number": 1, "title": "again"}
                ]
            }"#,
        );
        let err = FleetManifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate item number 1"));
    }

    #[test]
    fn test_bad_repo_slug_is_rejected() {
        let (_dir, path) = write_manifest(
            r#"{
                "repo": "not-a-slug",
                "agent_command": "agent",
                "items": [{"number": 1, "title": "first"}]
            }"#,
        );
        assert!(FleetManifest::load(&path).is_err());
    }

    #[test]
    fn test_out_of_range_gated_phase_is_rejected() {
        let (_dir, path) = write_manifest(
            r#"{
                "repo": "acme/widgets",
                "agent_command": "agent",
                "gated_phases": [6],
                "items": [{"number": 1, "title": "first"}]
            }"#,
        );
        assert!(FleetManifest::load(&path).is_err());
    }
}
