//! Dependency graph over logical resource names.
//!
//! Ordering comes only from explicit `depends_on` references. Ties between
//! independent nodes are broken by name so plans are deterministic.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ResourceSpec;
use crate::error::{PlanError, Result};
use crate::state::StackState;

/// Node name to the names it depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with its dependencies. Re-adding a node merges edges.
    pub fn add_node<I, S>(&mut self, name: impl Into<String>, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges
            .entry(name.into())
            .or_default()
            .extend(dependencies.into_iter().map(Into::into));
    }

    /// Graph of a desired resource list.
    #[must_use]
    pub fn from_specs(specs: &[ResourceSpec]) -> Self {
        let mut graph = Self::new();
        for spec in specs {
            graph.add_node(spec.name.as_str(), spec.depends_on.iter().map(String::as_str));
        }
        graph
    }

    /// Graph of the dependencies recorded in stored state. Edges to
    /// resources that are no longer recorded are dropped.
    #[must_use]
    pub fn from_state(state: &StackState) -> Self {
        let mut graph = Self::new();
        for resource in state.resources.values() {
            graph.add_node(
                resource.name.as_str(),
                resource
                    .dependencies
                    .iter()
                    .filter(|d| state.resources.contains_key(d.as_str()))
                    .map(String::as_str),
            );
        }
        graph
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    /// Nodes that directly depend on `name`, sorted.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains(name))
            .map(|(node, _)| node.as_str())
            .collect()
    }

    /// Orders nodes so every node comes after all of its dependencies.
    ///
    /// # Errors
    ///
    /// Returns `DanglingDependency` if an edge points outside the graph and
    /// `CyclicGraph` if no such order exists.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        for (node, deps) in &self.edges {
            if let Some(missing) = deps.iter().find(|d| !self.edges.contains_key(d.as_str())) {
                return Err(PlanError::DanglingDependency {
                    resource: node.clone(),
                    dependency: missing.clone(),
                }
                .into());
            }
        }

        let mut remaining: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(node) = ready.pop_first() {
            remaining.remove(node);
            order.push(node.to_string());
            for dependent in self.dependents(node) {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < self.edges.len() {
            let cycle = self
                .find_cycle()
                .unwrap_or_else(|| remaining.keys().map(ToString::to_string).collect());
            return Err(PlanError::CyclicGraph { cycle }.into());
        }

        Ok(order)
    }

    /// Finds one dependency cycle, returned as a closed path (`a -> b -> a`).
    /// Edges to unknown nodes are ignored.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut finished: BTreeSet<&str> = BTreeSet::new();
        let mut path: Vec<&str> = Vec::new();

        for start in self.edges.keys() {
            if let Some(cycle) = self.visit(start, &mut path, &mut finished) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        path: &mut Vec<&'a str>,
        finished: &mut BTreeSet<&'a str>,
    ) -> Option<Vec<String>> {
        if finished.contains(node) {
            return None;
        }
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }

        path.push(node);
        for dep in self.dependencies(node) {
            if self.contains(dep)
                && let Some(cycle) = self.visit(dep, path, finished)
            {
                return Some(cycle);
            }
        }
        path.pop();
        finished.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (node, deps) in edges {
            g.add_node(*node, deps.iter().copied());
        }
        g
    }

    #[test]
    fn test_dependencies_come_first() {
        let g = graph(&[("bucket-a", &["role-a"]), ("role-a", &[]), ("queue", &[])]);
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["queue", "role-a", "bucket-a"]);
    }

    #[test]
    fn test_diamond() {
        let g = graph(&[
            ("app", &["db", "cache"]),
            ("db", &["net"]),
            ("cache", &["net"]),
            ("net", &[]),
        ]);
        let order = g.topological_order().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("net") < pos("db"));
        assert!(pos("net") < pos("cache"));
        assert!(pos("db") < pos("app"));
        assert!(pos("cache") < pos("app"));
    }

    #[test]
    fn test_cycle_fails() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])]);
        let err = g.topological_order().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicGraph);

        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(g.find_cycle(), Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn test_dangling_dependency() {
        let g = graph(&[("bucket-a", &["role-a"])]);
        let err = g.topological_order().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(g.find_cycle().is_none());
    }

    #[test]
    fn test_dependents() {
        let g = graph(&[("a", &["base"]), ("b", &["base"]), ("base", &[])]);
        assert_eq!(g.dependents("base"), vec!["a", "b"]);
        assert!(g.dependents("a").is_empty());
        assert_eq!(g.len(), 3);
    }
}
