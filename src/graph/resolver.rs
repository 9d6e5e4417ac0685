//! Dependency resolution.
//!
//! Kahn's algorithm over the resource specs. Ready nodes are kept in a
//! min-heap keyed by declaration index so the order is stable across runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

use crate::error::{GraphError, Result, StackError};

use super::types::{ResourceSpec, build_dependents, build_index};

/// Computes a deterministic topological order of resources.
#[derive(Debug, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns declaration indices in dependency order.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` naming the resources on a cycle. No partial
    /// order is ever returned.
    pub fn resolve(&self, resources: &[ResourceSpec]) -> Result<Vec<usize>> {
        let index = build_index(resources);
        let dependents = build_dependents(resources, &index);

        let mut indegree: Vec<usize> = resources.iter().map(|r| r.dependencies.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(resources.len());
        while let Some(Reverse(current)) = ready.pop() {
            order.push(current);
            for &dependent in &dependents[current] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() == resources.len() {
            debug!("Resolved order for {} resources", order.len());
            return Ok(order);
        }

        let cycle = cycle_participants(resources, &dependents, &indegree);
        Err(StackError::Graph(GraphError::CyclicDependency {
            resources: cycle
                .into_iter()
                .map(|i| resources[i].id.name.clone())
                .collect(),
        }))
    }
}

/// Peels leftover nodes that only lead into a cycle without being on one.
///
/// After Kahn stops, every leftover node depends (transitively) on a cycle.
/// Removing leftovers with no leftover dependents, repeatedly, leaves the
/// nodes that sit on cycles. Returned in declaration order.
fn cycle_participants(
    resources: &[ResourceSpec],
    dependents: &[Vec<usize>],
    indegree: &[usize],
) -> Vec<usize> {
    let mut remaining: Vec<bool> = indegree.iter().map(|&d| d > 0).collect();
    let index = build_index(resources);

    let mut outdegree: Vec<usize> = (0..resources.len())
        .map(|i| {
            if remaining[i] {
                dependents[i].iter().filter(|&&d| remaining[d]).count()
            } else {
                0
            }
        })
        .collect();

    let mut sinks: Vec<usize> = (0..resources.len())
        .filter(|&i| remaining[i] && outdegree[i] == 0)
        .collect();

    while let Some(node) = sinks.pop() {
        remaining[node] = false;
        for dependency in &resources[node].dependencies {
            if let Some(&d) = index.get(dependency)
                && remaining[d]
            {
                outdegree[d] -= 1;
                if outdegree[d] == 0 {
                    sinks.push(d);
                }
            }
        }
    }

    (0..resources.len()).filter(|&i| remaining[i]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceType;
    use crate::graph::ResourceId;
    use std::collections::{BTreeMap, BTreeSet};

    fn spec(name: &str, index: usize, deps: &[&str]) -> ResourceSpec {
        ResourceSpec {
            id: ResourceId::new(name, ResourceType::Output),
            properties: BTreeMap::new(),
            dependencies: deps.iter().map(ToString::to_string).collect::<BTreeSet<_>>(),
            declaration_index: index,
            tags: BTreeMap::new(),
            spec_hash: String::new(),
        }
    }

    fn names(resources: &[ResourceSpec], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| resources[i].id.name.clone()).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let resources = vec![
            spec("service", 0, &["cluster", "task"]),
            spec("task", 1, &[]),
            spec("cluster", 2, &["vpc"]),
            spec("vpc", 3, &[]),
        ];

        let order = DependencyResolver::new().resolve(&resources).unwrap();
        let names = names(&resources, &order);

        let pos = |n: &str| names.iter().position(|x| x == n).unwrap();
        assert!(pos("vpc") < pos("cluster"));
        assert!(pos("cluster") < pos("service"));
        assert!(pos("task") < pos("service"));
    }

    #[test]
    fn test_ties_broken_by_declaration_order() {
        let resources = vec![
            spec("c", 0, &[]),
            spec("a", 1, &[]),
            spec("b", 2, &["c"]),
            spec("d", 3, &[]),
        ];

        let order = DependencyResolver::new().resolve(&resources).unwrap();
        assert_eq!(names(&resources, &order), vec!["c", "a", "b", "d"]);

        let again = DependencyResolver::new().resolve(&resources).unwrap();
        assert_eq!(order, again);
    }

    #[test]
    fn test_cycle_names_participants_only() {
        let resources = vec![
            spec("root", 0, &[]),
            spec("a", 1, &["root", "c"]),
            spec("b", 2, &["a"]),
            spec("c", 3, &["b"]),
            spec("leaf", 4, &["c"]),
        ];

        let err = DependencyResolver::new().resolve(&resources).unwrap_err();
        match err {
            StackError::Graph(GraphError::CyclicDependency { resources }) => {
                assert_eq!(resources, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_graph() {
        let order = DependencyResolver::new().resolve(&[]).unwrap();
        assert!(order.is_empty());
    }
}
