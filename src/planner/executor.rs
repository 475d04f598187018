//! Plan executor for applying execution plans.
//!
//! Operations run as soon as every operation they depend on has succeeded,
//! with at most `parallelism` provider calls in flight. A failed operation
//! skips everything downstream of it; unrelated branches keep going.
//! State is updated after each success, one operation at a time.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PropertyMap;
use crate::credentials::CredentialProvider;
use crate::error::{ErrorKind, Result, WardenError};
use crate::events::{ProgressEvent, ProgressSink};
use crate::provider::ProviderRegistry;
use crate::state::{ResourceState, StackState};

use super::plan::{ExecutionPlan, OperationKind, PlannedOperation};

/// Default number of concurrent provider calls.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Executor for execution plans.
#[derive(Debug)]
pub struct PlanExecutor<'a> {
    /// Adapters by resource type.
    registry: &'a ProviderRegistry,
    /// Maximum provider calls in flight.
    parallelism: usize,
    /// Read unchanged resources to make sure they still exist.
    confirm_unchanged: bool,
}

/// How one operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum OperationOutcome {
    /// The provider call succeeded.
    Succeeded,
    /// Nothing needed doing.
    Unchanged,
    /// The provider call failed.
    Failed {
        /// Error message.
        reason: String,
        /// Error classification.
        kind: ErrorKind,
    },
    /// Never attempted.
    Skipped {
        /// Why it was not attempted.
        reason: String,
    },
}

/// Why a pass stopped dispatching new work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassAbort {
    /// Classification of the aborting error.
    pub kind: ErrorKind,
    /// Error message.
    pub reason: String,
}

/// Result of executing a single operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    /// Logical resource name.
    pub name: String,
    /// Resource type.
    pub type_name: String,
    /// What was attempted.
    pub kind: OperationKind,
    /// How it ended.
    pub outcome: OperationOutcome,
    /// Provider identifier after the operation, if the resource exists.
    pub provider_id: Option<String>,
}

/// Result of executing the entire plan. Results are in plan order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    /// One result per planned operation.
    pub results: Vec<OperationResult>,
    /// Set when an error outside the per-resource taxonomy stopped the pass.
    pub aborted: Option<PassAbort>,
    /// Set when the pass was cancelled.
    pub cancelled: bool,
}

/// What a provider call left behind.
enum Applied {
    Created { provider_id: String, outputs: PropertyMap },
    Updated { outputs: PropertyMap },
    Deleted,
    Confirmed,
}

/// One finished operation, as collected from the in-flight set.
struct Attempt {
    index: usize,
    result: Result<Applied>,
    prior_gone: bool,
}

impl OperationOutcome {
    /// Returns true if dependents may proceed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Unchanged)
    }
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            parallelism: DEFAULT_PARALLELISM,
            confirm_unchanged: false,
        }
    }

    /// Sets the maximum number of concurrent provider calls. Zero means one.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = if parallelism == 0 { 1 } else { parallelism };
        self
    }

    /// Reads unchanged resources and recreates any that vanished.
    #[must_use]
    pub const fn with_confirm_unchanged(mut self, confirm: bool) -> Self {
        self.confirm_unchanged = confirm;
        self
    }

    /// Executes a plan against `state`.
    ///
    /// Never fails as a whole: per-operation failures are reported in the
    /// result, and an aborting error (credentials, internal) stops new
    /// dispatches while in-flight operations finish. Cancellation behaves
    /// the same way.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        state: &mut StackState,
        creds: &dyn CredentialProvider,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let total = plan.len();
        info!(
            "Executing plan with {} operations ({} actionable)",
            total,
            plan.actionable().len()
        );

        let mut outcomes: Vec<Option<OperationOutcome>> = vec![None; total];
        let mut provider_ids: Vec<Option<String>> = plan
            .operations
            .iter()
            .map(|op| op.prior.as_ref().map(|p| p.provider_id.clone()))
            .collect();
        let mut started = vec![false; total];
        let mut aborted: Option<PassAbort> = None;
        let mut in_flight = FuturesUnordered::new();

        loop {
            if aborted.is_none() && !cancel.is_cancelled() {
                for (index, op) in plan.operations.iter().enumerate() {
                    if in_flight.len() >= self.parallelism {
                        break;
                    }
                    if started[index] || outcomes[index].is_some() {
                        continue;
                    }
                    let ready = op
                        .dependencies
                        .iter()
                        .all(|dep| outcomes[*dep].as_ref().is_some_and(OperationOutcome::is_success));
                    if !ready {
                        continue;
                    }

                    started[index] = true;
                    if op.kind != OperationKind::Noop {
                        info!("{}", op.description());
                        sink.emit(ProgressEvent::OperationStarted {
                            resource: op.name.clone(),
                            kind: op.kind,
                        });
                    }
                    in_flight.push(self.run(index, op, creds));
                }
            }

            let Some(attempt) = in_flight.next().await else {
                break;
            };
            let index = attempt.index;
            let op = &plan.operations[index];

            let outcome = match attempt.result {
                Ok(applied) => {
                    let (outcome, provider_id) = Self::record(state, op, applied);
                    provider_ids[index] = provider_id;
                    outcome
                }
                Err(e) => {
                    if attempt.prior_gone && state.forget(&op.name).is_some() {
                        warn!("{} no longer exists at the provider, dropped from state", op.name);
                        provider_ids[index] = None;
                    }
                    let kind = e.kind();
                    error!("{} failed: {e}", op.description());
                    if kind.aborts_pass() && aborted.is_none() {
                        warn!("Aborting pass: {e}");
                        aborted = Some(PassAbort {
                            kind,
                            reason: e.to_string(),
                        });
                    }
                    OperationOutcome::Failed {
                        reason: e.to_string(),
                        kind,
                    }
                }
            };

            let failed = !outcome.is_success();
            sink.emit(ProgressEvent::OperationFinished {
                resource: op.name.clone(),
                kind: op.kind,
                outcome: outcome.clone(),
            });
            outcomes[index] = Some(outcome);
            if failed {
                Self::propagate_skip(plan, index, &mut outcomes, sink);
            }
        }

        let cancelled = cancel.is_cancelled();
        for (index, op) in plan.operations.iter().enumerate() {
            if outcomes[index].is_some() {
                continue;
            }
            let reason = match (&aborted, cancelled) {
                (Some(abort), _) => format!("pass aborted: {}", abort.reason),
                (None, true) => String::from("cancelled"),
                (None, false) => String::from("not scheduled"),
            };
            debug!("Skipping {}: {reason}", op.name);
            let outcome = OperationOutcome::Skipped { reason };
            sink.emit(ProgressEvent::OperationFinished {
                resource: op.name.clone(),
                kind: op.kind,
                outcome: outcome.clone(),
            });
            outcomes[index] = Some(outcome);
        }

        let results = plan
            .operations
            .iter()
            .zip(outcomes)
            .zip(provider_ids)
            .map(|((op, outcome), provider_id)| OperationResult {
                name: op.name.clone(),
                type_name: op.type_name().to_string(),
                kind: op.kind,
                outcome: outcome.unwrap_or(OperationOutcome::Skipped {
                    reason: String::from("not scheduled"),
                }),
                provider_id,
            })
            .collect();

        let result = ExecutionResult {
            results,
            aborted,
            cancelled,
        };
        info!("{result}");
        result
    }

    async fn run(
        &self,
        index: usize,
        op: &PlannedOperation,
        creds: &dyn CredentialProvider,
    ) -> Attempt {
        let mut prior_gone = false;
        let result = self.apply(op, creds, &mut prior_gone).await;
        Attempt {
            index,
            result,
            prior_gone,
        }
    }

    /// Performs the provider calls for one operation. `prior_gone` is set
    /// once the recorded resource is known to no longer exist.
    async fn apply(
        &self,
        op: &PlannedOperation,
        creds: &dyn CredentialProvider,
        prior_gone: &mut bool,
    ) -> Result<Applied> {
        match op.kind {
            OperationKind::Noop => {
                if !self.confirm_unchanged {
                    return Ok(Applied::Confirmed);
                }
                let (Some(spec), Some(prior)) = (&op.spec, &op.prior) else {
                    return Ok(Applied::Confirmed);
                };
                let adapter = self.registry.resolve(&prior.type_name)?;
                let cred = creds.credential().await?;
                if adapter.read(&prior.provider_id, &cred).await?.is_some() {
                    return Ok(Applied::Confirmed);
                }
                warn!("{} vanished at the provider, recreating", op.name);
                *prior_gone = true;
                let created = adapter.create(spec, &cred).await?;
                Ok(Applied::Created {
                    provider_id: created.provider_id,
                    outputs: created.outputs,
                })
            }
            OperationKind::Create => {
                let spec = Self::spec_of(op)?;
                let adapter = self.registry.resolve(&spec.type_name)?;
                let cred = creds.credential().await?;
                let created = adapter.create(spec, &cred).await?;
                Ok(Applied::Created {
                    provider_id: created.provider_id,
                    outputs: created.outputs,
                })
            }
            OperationKind::Update => {
                let spec = Self::spec_of(op)?;
                let prior = Self::prior_of(op)?;
                let adapter = self.registry.resolve(&spec.type_name)?;
                let cred = creds.credential().await?;
                match adapter.update(&prior.provider_id, spec, &cred).await {
                    Ok(outputs) => Ok(Applied::Updated { outputs }),
                    Err(WardenError::Provider(e)) if e.is_not_found() => {
                        warn!("{} vanished at the provider, recreating", op.name);
                        *prior_gone = true;
                        let created = adapter.create(spec, &cred).await?;
                        Ok(Applied::Created {
                            provider_id: created.provider_id,
                            outputs: created.outputs,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
            OperationKind::Replace => {
                let spec = Self::spec_of(op)?;
                let prior = Self::prior_of(op)?;
                let old = self.registry.resolve(&prior.type_name)?;
                let new = self.registry.resolve(&spec.type_name)?;
                let cred = creds.credential().await?;
                Self::delete_tolerant(old.as_ref(), &prior.provider_id, &cred).await?;
                *prior_gone = true;
                let created = new.create(spec, &cred).await?;
                Ok(Applied::Created {
                    provider_id: created.provider_id,
                    outputs: created.outputs,
                })
            }
            OperationKind::Delete => {
                let prior = Self::prior_of(op)?;
                let adapter = self.registry.resolve(&prior.type_name)?;
                let cred = creds.credential().await?;
                Self::delete_tolerant(adapter.as_ref(), &prior.provider_id, &cred).await?;
                Ok(Applied::Deleted)
            }
        }
    }

    async fn delete_tolerant(
        adapter: &dyn crate::provider::ProviderAdapter,
        provider_id: &str,
        cred: &crate::credentials::FederatedCredential,
    ) -> Result<()> {
        match adapter.delete(provider_id, cred).await {
            Err(WardenError::Provider(e)) if e.is_not_found() => {
                debug!("{provider_id} was already gone");
                Ok(())
            }
            other => other,
        }
    }

    fn spec_of(op: &PlannedOperation) -> Result<&crate::config::ResourceSpec> {
        op.spec
            .as_ref()
            .ok_or_else(|| WardenError::internal(format!("{} has no desired spec", op.name)))
    }

    fn prior_of(op: &PlannedOperation) -> Result<&ResourceState> {
        op.prior
            .as_ref()
            .ok_or_else(|| WardenError::internal(format!("{} has no recorded state", op.name)))
    }

    /// Writes a successful operation into state.
    fn record(
        state: &mut StackState,
        op: &PlannedOperation,
        applied: Applied,
    ) -> (OperationOutcome, Option<String>) {
        let fingerprint = op.fingerprint.clone().unwrap_or_default();
        match (applied, &op.spec) {
            (Applied::Created { provider_id, outputs }, Some(spec)) => {
                state.record(ResourceState::from_spec(
                    spec,
                    provider_id.as_str(),
                    outputs,
                    fingerprint,
                ));
                (OperationOutcome::Succeeded, Some(provider_id))
            }
            (Applied::Updated { outputs }, Some(spec)) => {
                let provider_id = op
                    .prior
                    .as_ref()
                    .map(|p| p.provider_id.clone())
                    .unwrap_or_default();
                let mut resource =
                    ResourceState::from_spec(spec, provider_id.as_str(), outputs, fingerprint);
                if let Some(prior) = &op.prior {
                    resource.created_at = prior.created_at;
                }
                state.record(resource);
                (OperationOutcome::Succeeded, Some(provider_id))
            }
            (Applied::Deleted, _) => {
                state.forget(&op.name);
                (OperationOutcome::Succeeded, None)
            }
            (Applied::Confirmed, spec) => {
                if let (Some(spec), Some(current)) = (spec, state.get(&op.name))
                    && (current.dependencies != spec.depends_on
                        || current.sensitive != spec.sensitive)
                {
                    let mut repaired = current.clone();
                    repaired.dependencies.clone_from(&spec.depends_on);
                    repaired.sensitive.clone_from(&spec.sensitive);
                    state.record(repaired);
                }
                let provider_id = state.get(&op.name).map(|r| r.provider_id.clone());
                (OperationOutcome::Unchanged, provider_id)
            }
            (Applied::Created { .. } | Applied::Updated { .. }, None) => (
                OperationOutcome::Failed {
                    reason: format!("{} has no desired spec", op.name),
                    kind: ErrorKind::Internal,
                },
                None,
            ),
        }
    }

    /// Marks everything downstream of a failed operation as skipped.
    fn propagate_skip(
        plan: &ExecutionPlan,
        failed: usize,
        outcomes: &mut [Option<OperationOutcome>],
        sink: &dyn ProgressSink,
    ) {
        let mut queue = VecDeque::from([failed]);
        while let Some(upstream) = queue.pop_front() {
            for dependent in plan.dependent_operations(upstream) {
                if outcomes[dependent].is_some() {
                    continue;
                }
                let op = &plan.operations[dependent];
                let reason = format!(
                    "dependency '{}' did not succeed",
                    plan.operations[upstream].name
                );
                warn!("Skipping {}: {reason}", op.name);
                let outcome = OperationOutcome::Skipped { reason };
                sink.emit(ProgressEvent::OperationFinished {
                    resource: op.name.clone(),
                    kind: op.kind,
                    outcome: outcome.clone(),
                });
                outcomes[dependent] = Some(outcome);
                queue.push_back(dependent);
            }
        }
    }
}

impl ExecutionResult {
    /// Returns true if nothing failed, nothing was skipped, and the pass ran
    /// to completion.
    #[must_use]
    pub fn success(&self) -> bool {
        self.aborted.is_none()
            && !self.cancelled
            && self.results.iter().all(|r| r.outcome.is_success())
    }

    /// Number of operations that changed something.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Succeeded))
    }

    /// Number of operations that had nothing to do.
    #[must_use]
    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Unchanged))
    }

    /// Number of failed operations.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Failed { .. }))
    }

    /// Number of skipped operations.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, OperationOutcome::Skipped { .. }))
    }

    /// Failed operations, in plan order.
    #[must_use]
    pub fn failures(&self) -> Vec<&OperationResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, OperationOutcome::Failed { .. }))
            .collect()
    }

    /// Looks up the result for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OperationResult> {
        self.results.iter().find(|r| r.name == name)
    }

    fn count(&self, pred: impl Fn(&OperationOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

impl std::fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed { reason, kind } => write!(f, "failed ({kind}): {reason}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} operations: {} succeeded, {} unchanged, {} failed, {} skipped",
            self.results.len(),
            self.succeeded(),
            self.unchanged(),
            self.failed(),
            self.skipped()
        )
    }
}
