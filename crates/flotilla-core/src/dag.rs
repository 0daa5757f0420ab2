//! Immutable dependency graph over a fleet's work items.
//!
//! Items are layered into topological "waves": wave 0 holds items with no
//! unresolved dependencies, wave N holds items whose dependencies all sit in
//! earlier waves. Waves exist for reporting and checkpoint metadata; the
//! scheduler runs an event-driven readiness loop, not wave barriers.
//!
//! Construction is the only mutation point. A mapping that cannot be fully
//! layered contains a cycle and fails with
//! [`FleetError::CyclicDependency`] naming the unresolved items.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{FleetError, Result};
use crate::model::WorkItem;

/// Read-only dependency DAG for one fleet run.
#[derive(Debug, Clone)]
pub struct IssueDag {
    items: HashMap<u64, WorkItem>,
    /// `item → items it depends on`, restricted to known items.
    edges: HashMap<u64, Vec<u64>>,
    /// `item → items depending on it` (derived).
    dependents: HashMap<u64, Vec<u64>>,
    waves: Vec<Vec<u64>>,
}

impl IssueDag {
    /// Build a DAG from the full work-item set and a dependency mapping.
    ///
    /// Edges referencing identifiers outside the item set are silently
    /// dropped (the mapping may come from an agent that hallucinated a
    /// number). Self-edges are dropped with the unknowns.
    pub fn build(items: &[WorkItem], deps: &HashMap<u64, Vec<u64>>) -> Result<IssueDag> {
        let known: HashSet<u64> = items.iter().map(|i| i.number).collect();

        let mut edges: HashMap<u64, Vec<u64>> = HashMap::new();
        for item in items {
            let mut filtered: Vec<u64> = deps
                .get(&item.number)
                .into_iter()
                .flatten()
                .copied()
                .filter(|d| known.contains(d) && *d != item.number)
                .collect();
            filtered.sort_unstable();
            filtered.dedup();
            edges.insert(item.number, filtered);
        }

        let waves = layer_waves(&known, &edges)?;

        let mut dependents: HashMap<u64, Vec<u64>> = HashMap::new();
        for (&item, item_deps) in &edges {
            for &dep in item_deps {
                dependents.entry(dep).or_default().push(item);
            }
        }
        for list in dependents.values_mut() {
            list.sort_unstable();
        }

        Ok(IssueDag {
            items: items.iter().map(|i| (i.number, i.clone())).collect(),
            edges,
            dependents,
            waves,
        })
    }

    /// Ordered topological layers, each sorted by item number.
    pub fn waves(&self) -> &[Vec<u64>] {
        &self.waves
    }

    /// The full filtered edge mapping.
    pub fn edges(&self) -> &HashMap<u64, Vec<u64>> {
        &self.edges
    }

    /// Direct dependencies of an item (empty for unknown items).
    pub fn direct_deps(&self, number: u64) -> &[u64] {
        self.edges.get(&number).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All transitive dependencies of an item, ordered nearest-first
    /// (breadth-first over upstream edges, deduplicated).
    pub fn transitive_deps_ordered(&self, number: u64) -> Vec<u64> {
        let mut seen: HashSet<u64> = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue: VecDeque<u64> = self.direct_deps(number).iter().copied().collect();

        while let Some(dep) = queue.pop_front() {
            if seen.insert(dep) {
                ordered.push(dep);
                queue.extend(self.direct_deps(dep).iter().copied());
            }
        }
        ordered
    }

    /// Items directly depending on `number`.
    pub fn direct_dependents(&self, number: u64) -> &[u64] {
        self.dependents
            .get(&number)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The work item for a number, if it is part of this run.
    pub fn item(&self, number: u64) -> Option<&WorkItem> {
        self.items.get(&number)
    }

    /// Number of items in the graph.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Repeatedly extract every item whose remaining dependencies are already
/// placed. Items that can never be placed are part of a cycle.
fn layer_waves(known: &HashSet<u64>, edges: &HashMap<u64, Vec<u64>>) -> Result<Vec<Vec<u64>>> {
    let mut remaining: BTreeSet<u64> = known.iter().copied().collect();
    let mut placed: HashSet<u64> = HashSet::new();
    let mut waves: Vec<Vec<u64>> = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<u64> = remaining
            .iter()
            .copied()
            .filter(|n| {
                edges
                    .get(n)
                    .map(|deps| deps.iter().all(|d| placed.contains(d)))
                    .unwrap_or(true)
            })
            .collect();

        if ready.is_empty() {
            return Err(FleetError::CyclicDependency {
                items: remaining.into_iter().collect(),
            });
        }

        for n in &ready {
            remaining.remove(n);
            placed.insert(*n);
        }
        waves.push(ready);
    }

    Ok(waves)
}
