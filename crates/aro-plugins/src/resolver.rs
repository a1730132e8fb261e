//! Dependency resolution.
//!
//! Orders plugins so every plugin comes after the plugins it depends on.
//! Traversal is a depth-first search with three marks per node; meeting a
//! node that is still in progress means a cycle, and the search stack at
//! that point is the cycle path. Roots and edges are visited in name order,
//! so the same input always yields the same order.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::ResolutionError;
use crate::manifest::PluginDescriptor;
use crate::plugin::PluginId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Candidate plugins keyed by name, with dependency edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<PluginId, PluginDescriptor>,
}

impl DependencyGraph {
    /// Build the graph, failing on the first duplicate name.
    ///
    /// # Errors
    ///
    /// Returns [`ResolutionError::DuplicatePlugin`].
    pub fn new(descriptors: Vec<PluginDescriptor>) -> Result<Self, ResolutionError> {
        let (graph, duplicates) = Self::build(descriptors);
        match duplicates.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(graph),
        }
    }

    /// Build the graph keeping the first descriptor of each name and
    /// reporting the others.
    fn build(descriptors: Vec<PluginDescriptor>) -> (Self, Vec<ResolutionError>) {
        let mut nodes: BTreeMap<PluginId, PluginDescriptor> = BTreeMap::new();
        let mut duplicates = Vec::new();
        for desc in descriptors {
            if let Some(existing) = nodes.get(&desc.name) {
                duplicates.push(ResolutionError::DuplicatePlugin {
                    name: desc.name.clone(),
                    first: existing.root.clone(),
                    second: desc.root.clone(),
                });
                continue;
            }
            nodes.insert(desc.name.clone(), desc);
        }
        (Self { nodes }, duplicates)
    }

    /// Number of plugins in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a plugin.
    #[must_use]
    pub fn get(&self, id: &PluginId) -> Option<&PluginDescriptor> {
        self.nodes.get(id)
    }

    /// Check one plugin's direct edges: every target exists and satisfies
    /// the declared requirement.
    fn check_edges(&self, desc: &PluginDescriptor) -> Result<(), ResolutionError> {
        for dep in &desc.dependencies {
            let Some(target) = self.nodes.get(&dep.name) else {
                return Err(ResolutionError::MissingDependency {
                    requester: desc.name.clone(),
                    missing: dep.name.to_string(),
                    requirement: dep.requirement.clone(),
                });
            };
            if !dep.requirement.matches(&target.version) {
                return Err(ResolutionError::VersionMismatch {
                    requester: desc.name.clone(),
                    dependency: dep.name.clone(),
                    required: dep.requirement.clone(),
                    found: target.version.clone(),
                });
            }
        }
        Ok(())
    }

    /// Topologically order the plugins accepted by `include`. Edges must
    /// only point at included plugins.
    fn order_where(&self, include: impl Fn(&PluginId) -> bool) -> Result<Vec<PluginId>, ResolutionError> {
        let mut marks: BTreeMap<&PluginId, Mark> = self
            .nodes
            .keys()
            .filter(|id| include(id))
            .map(|id| (id, Mark::Unvisited))
            .collect();
        let roots: Vec<&PluginId> = marks.keys().copied().collect();
        let mut order = Vec::with_capacity(roots.len());
        let mut stack = Vec::new();
        for root in roots {
            self.visit(root, &mut marks, &mut stack, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &'a PluginId,
        marks: &mut BTreeMap<&'a PluginId, Mark>,
        stack: &mut Vec<&'a PluginId>,
        order: &mut Vec<PluginId>,
    ) -> Result<(), ResolutionError> {
        match marks.get(id).copied().unwrap_or(Mark::Done) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path: Vec<PluginId> = stack[start..].iter().map(|s| (*s).clone()).collect();
                path.push(id.clone());
                return Err(ResolutionError::Cycle { path });
            },
            Mark::Unvisited => {},
        }

        marks.insert(id, Mark::InProgress);
        stack.push(id);
        if let Some(desc) = self.nodes.get(id) {
            let deps: BTreeSet<&PluginId> = desc.dependencies.iter().map(|d| &d.name).collect();
            for dep in deps {
                self.visit(dep, marks, stack, order)?;
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        order.push(id.clone());
        Ok(())
    }

    fn into_descriptors(mut self, order: Vec<PluginId>) -> Vec<PluginDescriptor> {
        order
            .into_iter()
            .filter_map(|id| self.nodes.remove(&id))
            .collect()
    }
}

/// Resolve a load order, failing on the first problem.
///
/// Every edge is checked before any ordering happens, so a missing
/// dependency is reported even when the graph also has a cycle.
///
/// # Errors
///
/// Returns the first [`ResolutionError`] found, checking plugins in name
/// order.
pub fn resolve(descriptors: Vec<PluginDescriptor>) -> Result<Vec<PluginDescriptor>, ResolutionError> {
    let graph = DependencyGraph::new(descriptors)?;
    for desc in graph.nodes.values() {
        graph.check_edges(desc)?;
    }
    let order = graph.order_where(|_| true)?;
    debug!(order = ?order, "resolved plugin load order");
    Ok(graph.into_descriptors(order))
}

/// Outcome of [`resolve_lenient`].
#[derive(Debug, Default)]
pub struct LenientResolution {
    /// Plugins whose whole dependency closure resolved, in load order.
    pub order: Vec<PluginDescriptor>,
    /// One error per dropped plugin (one per cycle for cycle members).
    pub failures: Vec<ResolutionError>,
}

/// Resolve a load order, dropping plugins that cannot be resolved and
/// everything that depends on them.
#[must_use]
pub fn resolve_lenient(descriptors: Vec<PluginDescriptor>) -> LenientResolution {
    let (graph, mut failures) = DependencyGraph::build(descriptors);
    let mut failed: BTreeSet<PluginId> = BTreeSet::new();

    for desc in graph.nodes.values() {
        if let Err(e) = graph.check_edges(desc) {
            failed.insert(desc.name.clone());
            failures.push(e);
        }
    }

    let order = loop {
        propagate_failures(&graph, &mut failed, &mut failures);
        match graph.order_where(|id| !failed.contains(id)) {
            Ok(order) => break order,
            Err(ResolutionError::Cycle { path }) => {
                failed.extend(path.iter().cloned());
                failures.push(ResolutionError::Cycle { path });
            },
            Err(other) => {
                failed.insert(other.plugin().clone());
                failures.push(other);
            },
        }
    };

    for failure in &failures {
        warn!(plugin = %failure.plugin(), error = %failure, "dropping plugin from load order");
    }

    LenientResolution {
        order: graph.into_descriptors(order),
        failures,
    }
}

/// Mark every plugin with a failed dependency as failed, until nothing
/// changes.
fn propagate_failures(
    graph: &DependencyGraph,
    failed: &mut BTreeSet<PluginId>,
    failures: &mut Vec<ResolutionError>,
) {
    loop {
        let newly: Vec<(PluginId, PluginId)> = graph
            .nodes
            .values()
            .filter(|d| !failed.contains(&d.name))
            .filter_map(|d| {
                d.dependencies
                    .iter()
                    .find(|dep| failed.contains(&dep.name))
                    .map(|dep| (d.name.clone(), dep.name.clone()))
            })
            .collect();
        if newly.is_empty() {
            return;
        }
        for (plugin, dependency) in newly {
            failed.insert(plugin.clone());
            failures.push(ResolutionError::DependencyFailed { plugin, dependency });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plugin(name: &str, version: &str, deps: &[(&str, &str)]) -> PluginDescriptor {
        let deps: serde_json::Map<String, serde_json::Value> = deps
            .iter()
            .map(|(n, r)| ((*n).to_owned(), json!(r)))
            .collect();
        PluginDescriptor::from_value(
            json!({
                "name": name,
                "version": version,
                "provides": [{ "type": "declarative", "path": "." }],
                "dependencies": deps,
            }),
            format!("/plugins/{name}"),
        )
        .unwrap()
    }

    fn names(order: &[PluginDescriptor]) -> Vec<&str> {
        order.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn test_chain_orders_dependencies_first() {
        let order = resolve(vec![
            plugin("a", "1.0.0", &[("b", "*")]),
            plugin("b", "1.0.0", &[("c", "*")]),
            plugin("c", "1.0.0", &[]),
        ])
        .unwrap();
        assert_eq!(names(&order), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_order_is_deterministic_regardless_of_input_order() {
        let make = || {
            vec![
                plugin("zeta", "1.0.0", &[]),
                plugin("alpha", "1.0.0", &[("zeta", "*")]),
                plugin("mid", "1.0.0", &[]),
            ]
        };
        let mut reversed = make();
        reversed.reverse();
        let first = resolve(make()).unwrap();
        let second = resolve(reversed).unwrap();
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&first), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_diamond_loads_shared_dependency_once() {
        let order = resolve(vec![
            plugin("app", "1.0.0", &[("left", "*"), ("right", "*")]),
            plugin("left", "1.0.0", &[("base", "*")]),
            plugin("right", "1.0.0", &[("base", "*")]),
            plugin("base", "1.0.0", &[]),
        ])
        .unwrap();
        assert_eq!(names(&order), vec!["base", "left", "right", "app"]);
    }

    #[test]
    fn test_two_node_cycle_reports_full_path() {
        let err = resolve(vec![
            plugin("a", "1.0.0", &[("b", "*")]),
            plugin("b", "1.0.0", &[("a", "*")]),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle: a → b → a");
    }

    #[test]
    fn test_longer_cycle_excludes_entry_path() {
        let err = resolve(vec![
            plugin("a", "1.0.0", &[("b", "*")]),
            plugin("b", "1.0.0", &[("c", "*")]),
            plugin("c", "1.0.0", &[("d", "*")]),
            plugin("d", "1.0.0", &[("b", "*")]),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle: b → c → d → b");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = resolve(vec![plugin("a", "1.0.0", &[("a", "*")])]).unwrap_err();
        assert!(matches!(err, ResolutionError::Cycle { ref path } if path.len() == 2));
    }

    #[test]
    fn test_missing_dependency() {
        let err = resolve(vec![plugin("a", "1.0.0", &[("ghost", "^1")])]).unwrap_err();
        match err {
            ResolutionError::MissingDependency {
                requester, missing, ..
            } => {
                assert_eq!(requester.as_str(), "a");
                assert_eq!(missing, "ghost");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_version_mismatch_is_distinct_from_missing() {
        let err = resolve(vec![
            plugin("a", "1.0.0", &[("b", "^2.0")]),
            plugin("b", "1.4.0", &[]),
        ])
        .unwrap_err();
        match err {
            ResolutionError::VersionMismatch { found, .. } => {
                assert_eq!(found, semver::Version::new(1, 4, 0));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = resolve(vec![plugin("a", "1.0.0", &[]), plugin("a", "2.0.0", &[])]).unwrap_err();
        assert!(matches!(err, ResolutionError::DuplicatePlugin { .. }));
    }

    #[test]
    fn test_lenient_drops_failures_and_dependents() {
        let result = resolve_lenient(vec![
            plugin("ok", "1.0.0", &[]),
            plugin("broken", "1.0.0", &[("ghost", "*")]),
            plugin("user", "1.0.0", &[("broken", "*")]),
            plugin("x", "1.0.0", &[("y", "*")]),
            plugin("y", "1.0.0", &[("x", "*")]),
            plugin("fine", "1.0.0", &[("ok", "*")]),
        ]);
        assert_eq!(names(&result.order), vec!["ok", "fine"]);
        let failed: BTreeSet<String> = result
            .failures
            .iter()
            .map(|f| f.plugin().to_string())
            .collect();
        assert!(failed.contains("broken"));
        assert!(failed.contains("user"));
        assert!(failed.contains("x"));
        assert!(result
            .failures
            .iter()
            .any(|f| matches!(f, ResolutionError::DependencyFailed { plugin, .. } if plugin.as_str() == "user")));
    }
}
