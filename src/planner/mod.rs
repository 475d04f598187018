//! Planning module for reconciliation passes.
//!
//! This module compares the desired graph with stored state, orders the
//! resulting operations, and executes them against provider adapters.

mod diff;
mod executor;
mod graph;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{
    DEFAULT_PARALLELISM, ExecutionResult, OperationOutcome, OperationResult, PassAbort,
    PlanExecutor,
};
pub use graph::DependencyGraph;
pub use plan::{ExecutionPlan, OperationKind, PlannedOperation};
