//! Execution plan types and construction.
//!
//! A plan is an ordered list of operations with explicit dependency edges
//! between them. Creates and updates appear in dependency order of the
//! desired graph. Deletes appear in reverse dependency order of the stored
//! graph, each waiting for every operation on its stored dependents.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::diff::{DiffResult, DiffType};
use super::graph::DependencyGraph;
use crate::config::ResourceSpec;
use crate::error::Result;
use crate::state::{ResourceState, StackState};

/// A complete execution plan. Never persisted.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Operations in scheduling order.
    pub operations: Vec<PlannedOperation>,
}

/// A single planned operation.
#[derive(Debug, Clone)]
pub struct PlannedOperation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Logical resource name.
    pub name: String,
    /// Desired spec (everything except deletes).
    pub spec: Option<ResourceSpec>,
    /// Stored record (everything except creates).
    pub prior: Option<ResourceState>,
    /// Fingerprint to store on success.
    pub fingerprint: Option<String>,
    /// Why the operation is needed.
    pub reason: String,
    /// Indices of operations that must succeed first.
    pub dependencies: Vec<usize>,
}

/// Types of operations in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete the old resource, then create the new one.
    Replace,
    /// Delete a resource.
    Delete,
    /// Nothing to do.
    Noop,
}

impl ExecutionPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            created_at: Utc::now(),
            operations: vec![],
        }
    }

    /// Builds the plan converging `state` toward `desired`.
    ///
    /// # Errors
    ///
    /// Returns `CyclicGraph` or `DanglingDependency` if the desired graph
    /// cannot be ordered. Nothing has been executed at that point.
    pub fn from_diff(diff: &DiffResult, desired: &[ResourceSpec], state: &StackState) -> Result<Self> {
        let forward = DependencyGraph::from_specs(desired).topological_order()?;
        let stored = DependencyGraph::from_state(state);
        let stored_order = stored.topological_order()?;
        let specs: HashMap<&str, &ResourceSpec> =
            desired.iter().map(|s| (s.name.as_str(), s)).collect();

        let mut operations = Vec::with_capacity(diff.diffs.len());
        let mut index: HashMap<String, usize> = HashMap::new();

        for name in &forward {
            let (Some(spec), Some(resource_diff)) = (specs.get(name.as_str()), diff.get(name)) else {
                continue;
            };
            let (kind, reason) = match resource_diff.diff_type {
                DiffType::Create => (OperationKind::Create, String::from("not yet created")),
                DiffType::Update => (OperationKind::Update, String::from("specification changed")),
                DiffType::Replace => (OperationKind::Replace, String::from("resource type changed")),
                DiffType::NoChange | DiffType::Delete => (OperationKind::Noop, String::new()),
            };
            let dependencies = spec
                .depends_on
                .iter()
                .filter_map(|dep| index.get(dep).copied())
                .collect();

            index.insert(name.clone(), operations.len());
            operations.push(PlannedOperation {
                kind,
                name: name.clone(),
                spec: Some((*spec).clone()),
                prior: state.get(name).cloned(),
                fingerprint: resource_diff.new_hash.clone(),
                reason,
                dependencies,
            });
        }

        let doomed: Vec<&String> = stored_order
            .iter()
            .rev()
            .filter(|name| diff.get(name).is_some_and(|d| d.diff_type == DiffType::Delete))
            .collect();
        Self::push_deletes(&mut operations, &mut index, &doomed, &stored, state, "no longer desired");

        Ok(Self {
            created_at: Utc::now(),
            operations,
        })
    }

    /// Builds a plan deleting every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns `CyclicGraph` if the stored graph cannot be ordered.
    pub fn for_destroy(state: &StackState) -> Result<Self> {
        let stored = DependencyGraph::from_state(state);
        let order = stored.topological_order()?;
        let doomed: Vec<&String> = order.iter().rev().collect();

        let mut operations = Vec::with_capacity(doomed.len());
        let mut index = HashMap::new();
        Self::push_deletes(&mut operations, &mut index, &doomed, &stored, state, "stack destroyed");

        Ok(Self {
            created_at: Utc::now(),
            operations,
        })
    }

    /// `doomed` must already be in reverse dependency order.
    fn push_deletes(
        operations: &mut Vec<PlannedOperation>,
        index: &mut HashMap<String, usize>,
        doomed: &[&String],
        stored: &DependencyGraph,
        state: &StackState,
        reason: &str,
    ) {
        for name in doomed {
            let dependencies = stored
                .dependents(name)
                .into_iter()
                .filter_map(|dependent| index.get(dependent).copied())
                .collect();
            index.insert((*name).clone(), operations.len());
            operations.push(PlannedOperation {
                kind: OperationKind::Delete,
                name: (*name).clone(),
                spec: None,
                prior: state.get(name).cloned(),
                fingerprint: None,
                reason: reason.to_string(),
                dependencies,
            });
        }
    }

    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.iter().all(|op| op.kind == OperationKind::Noop)
    }

    /// Number of operations, including no-ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Number of operations of the given kind.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    /// Operations that change something.
    #[must_use]
    pub fn actionable(&self) -> Vec<&PlannedOperation> {
        self.operations
            .iter()
            .filter(|op| op.kind != OperationKind::Noop)
            .collect()
    }

    /// Indices of operations that directly depend on `index`.
    #[must_use]
    pub fn dependent_operations(&self, index: usize) -> Vec<usize> {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.dependencies.contains(&index))
            .map(|(i, _)| i)
            .collect()
    }

    /// `(kind, name)` pairs of the operations that change something, in order.
    #[must_use]
    pub fn summary(&self) -> Vec<(OperationKind, &str)> {
        self.actionable()
            .into_iter()
            .map(|op| (op.kind, op.name.as_str()))
            .collect()
    }
}

impl PlannedOperation {
    /// Resource type the operation acts on.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.spec
            .as_ref()
            .map(|s| s.type_name.as_str())
            .or_else(|| self.prior.as_ref().map(|p| p.type_name.as_str()))
            .unwrap_or_default()
    }

    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            OperationKind::Create => format!("Create {} '{}'", self.type_name(), self.name),
            OperationKind::Update => format!("Update {} '{}'", self.type_name(), self.name),
            OperationKind::Replace => format!("Replace '{}' with a {}", self.name, self.type_name()),
            OperationKind::Delete => format!("Delete {} '{}'", self.type_name(), self.name),
            OperationKind::Noop => format!("No change for '{}'", self.name),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let actionable = self.actionable();
        if actionable.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} operations):", actionable.len())?;
        for (i, op) in actionable.iter().enumerate() {
            writeln!(f, "  {}. {op}", i + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropertyMap;
    use crate::error::ErrorKind;
    use crate::planner::DiffEngine;

    fn plan_for(desired: &[ResourceSpec], state: &StackState) -> Result<ExecutionPlan> {
        let diff = DiffEngine::new().compute_diff(desired, state);
        ExecutionPlan::from_diff(&diff, desired, state)
    }

    fn applied_state(specs: &[ResourceSpec]) -> StackState {
        let engine = DiffEngine::new();
        let mut state = StackState::empty("dev-stack", "dev");
        for spec in specs {
            state.record(ResourceState::from_spec(
                spec,
                format!("{}-1", spec.name),
                PropertyMap::new(),
                engine.fingerprint(spec),
            ));
        }
        state
    }

    fn graph() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("bucket-a", "bucket").depends_on("role-a"),
            ResourceSpec::new("role-a", "role"),
        ]
    }

    #[test]
    fn test_single_create() {
        let state = StackState::empty("dev-stack", "dev");
        let plan = plan_for(&[ResourceSpec::new("bucket-a", "bucket")], &state).unwrap();
        assert_eq!(plan.summary(), vec![(OperationKind::Create, "bucket-a")]);
    }

    #[test]
    fn test_dependency_creates_first() {
        let state = StackState::empty("dev-stack", "dev");
        let plan = plan_for(&graph(), &state).unwrap();
        assert_eq!(
            plan.summary(),
            vec![
                (OperationKind::Create, "role-a"),
                (OperationKind::Create, "bucket-a"),
            ]
        );
        assert_eq!(plan.operations[1].dependencies, vec![0]);
        assert_eq!(plan.dependent_operations(0), vec![1]);
    }

    #[test]
    fn test_destroy_is_reverse_of_create() {
        let specs = graph();
        let create = plan_for(&specs, &StackState::empty("dev-stack", "dev")).unwrap();
        let destroy = ExecutionPlan::for_destroy(&applied_state(&specs)).unwrap();

        let created: Vec<&str> = create.operations.iter().map(|o| o.name.as_str()).collect();
        let mut deleted: Vec<&str> = destroy.operations.iter().map(|o| o.name.as_str()).collect();
        deleted.reverse();
        assert_eq!(created, deleted);

        assert_eq!(destroy.operations[0].name, "bucket-a");
        assert_eq!(destroy.operations[1].dependencies, vec![0]);
    }

    #[test]
    fn test_unchanged_graph_is_empty_plan() {
        let specs = graph();
        let state = applied_state(&specs);
        let plan = plan_for(&specs, &state).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.count(OperationKind::Noop), 2);
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let state = applied_state(&[ResourceSpec::new("bucket-a", "bucket")]);
        let plan = plan_for(&[], &state).unwrap();
        assert_eq!(plan.summary(), vec![(OperationKind::Delete, "bucket-a")]);
        assert_eq!(plan.operations[0].prior.as_ref().unwrap().provider_id, "bucket-a-1");
    }

    #[test]
    fn test_cycle_fails_before_planning() {
        let specs = vec![
            ResourceSpec::new("a", "bucket").depends_on("b"),
            ResourceSpec::new("b", "bucket").depends_on("a"),
        ];
        let err = plan_for(&specs, &StackState::empty("dev-stack", "dev")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicGraph);
    }

    #[test]
    fn test_replace_on_type_change() {
        let state = applied_state(&[ResourceSpec::new("store", "bucket")]);
        let plan = plan_for(&[ResourceSpec::new("store", "table")], &state).unwrap();
        assert_eq!(plan.summary(), vec![(OperationKind::Replace, "store")]);
        assert_eq!(plan.operations[0].type_name(), "table");
    }
}
