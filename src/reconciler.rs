//! Reconciliation engine.
//!
//! Ties the diff engine, planner and executor together behind one facade, and
//! implements the read-only refresh that brings live provider values into
//! stored state.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PropertyMap, ResourceSpec};
use crate::credentials::CredentialProvider;
use crate::error::{ErrorKind, Result, WardenError};
use crate::events::{ProgressEvent, ProgressSink};
use crate::planner::{
    DEFAULT_PARALLELISM, DiffEngine, DiffResult, DiffType, ExecutionPlan, ExecutionResult, PassAbort,
    PlanExecutor,
};
use crate::provider::ProviderRegistry;
use crate::state::{ResourceState, StackState};

/// Plans and applies changes to a stack.
#[derive(Debug)]
pub struct ReconciliationEngine {
    /// Adapters by resource type.
    registry: ProviderRegistry,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Maximum concurrent provider calls.
    parallelism: usize,
    /// Read unchanged resources during apply.
    confirm_unchanged: bool,
}

/// What a refresh found for one recorded resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RefreshStatus {
    /// Live values match the record.
    InSync,
    /// Only provider-reported outputs changed.
    OutputsUpdated,
    /// Applied properties were changed outside the engine.
    Drifted {
        /// Property keys whose live value differs.
        fields: Vec<String>,
    },
    /// The resource no longer exists and was dropped from state.
    Vanished,
    /// The read failed.
    Unreadable {
        /// Error message.
        reason: String,
        /// Error classification.
        kind: ErrorKind,
    },
    /// The read was never attempted.
    NotChecked {
        /// Why.
        reason: String,
    },
}

/// One refreshed resource.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshEntry {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub type_name: String,
    /// Outcome of the read.
    pub status: RefreshStatus,
}

/// Result of a refresh pass, in name order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// One entry per recorded resource.
    pub entries: Vec<RefreshEntry>,
    /// Set when an aborting error occurred.
    pub aborted: Option<PassAbort>,
    /// Set when the pass was cancelled.
    pub cancelled: bool,
}

enum LiveRead {
    Found(PropertyMap),
    Gone,
    Failed(WardenError),
    NotChecked,
}

impl ReconciliationEngine {
    /// Creates an engine with default tuning.
    #[must_use]
    pub const fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            diff_engine: DiffEngine::new(),
            parallelism: DEFAULT_PARALLELISM,
            confirm_unchanged: false,
        }
    }

    /// Creates an engine tuned by the stack file.
    #[must_use]
    pub fn from_config(registry: ProviderRegistry, config: &EngineConfig) -> Self {
        Self::new(registry)
            .with_parallelism(config.parallelism)
            .with_confirm_unchanged(config.confirm_unchanged)
    }

    /// Sets the maximum number of concurrent provider calls.
    #[must_use]
    pub const fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = if parallelism == 0 { 1 } else { parallelism };
        self
    }

    /// Confirms unchanged resources with a read during apply.
    #[must_use]
    pub const fn with_confirm_unchanged(mut self, confirm: bool) -> Self {
        self.confirm_unchanged = confirm;
        self
    }

    /// Returns the provider registry.
    #[must_use]
    pub const fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Computes the per-resource diff.
    #[must_use]
    pub fn diff(&self, desired: &[ResourceSpec], state: &StackState) -> DiffResult {
        self.diff_engine.compute_diff(desired, state)
    }

    /// Builds the plan converging `state` toward `desired`.
    ///
    /// # Errors
    ///
    /// Returns `CyclicGraph` if the desired graph has a cycle.
    pub fn plan(&self, desired: &[ResourceSpec], state: &StackState) -> Result<ExecutionPlan> {
        let diff = self.diff(desired, state);
        info!(
            "Diff: {} to create, {} to update, {} to replace, {} to delete",
            diff.count(DiffType::Create),
            diff.count(DiffType::Update),
            diff.count(DiffType::Replace),
            diff.count(DiffType::Delete)
        );
        ExecutionPlan::from_diff(&diff, desired, state)
    }

    /// Builds the plan deleting every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns `CyclicGraph` if the stored graph has a cycle.
    pub fn plan_destroy(&self, state: &StackState) -> Result<ExecutionPlan> {
        ExecutionPlan::for_destroy(state)
    }

    /// Executes a plan, updating `state` after every success.
    pub async fn apply(
        &self,
        plan: &ExecutionPlan,
        state: &mut StackState,
        creds: &dyn CredentialProvider,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        PlanExecutor::new(&self.registry)
            .with_parallelism(self.parallelism)
            .with_confirm_unchanged(self.confirm_unchanged)
            .execute(plan, state, creds, sink, cancel)
            .await
    }

    /// Reads every recorded resource and folds live values into `state`.
    ///
    /// Vanished resources are dropped so the next `up` recreates them. A
    /// property changed outside the engine is written back to the record
    /// with a new fingerprint so the next `up` converges it.
    pub async fn refresh(
        &self,
        state: &mut StackState,
        creds: &dyn CredentialProvider,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> RefreshReport {
        info!("Refreshing {} recorded resources", state.resources.len());
        let recorded: Vec<ResourceState> = state.resources.values().cloned().collect();

        let reads: Vec<LiveRead> = stream::iter(recorded.iter())
            .map(|resource| self.read_live(resource, creds, cancel))
            .buffered(self.parallelism)
            .collect()
            .await;

        let mut report = RefreshReport {
            cancelled: cancel.is_cancelled(),
            ..RefreshReport::default()
        };
        for (resource, read) in recorded.iter().zip(reads) {
            let status = match read {
                LiveRead::Found(live) => self.fold_live(state, resource, live, sink),
                LiveRead::Gone => {
                    warn!("{} no longer exists at the provider", resource.name);
                    state.detach(&resource.name);
                    sink.emit(ProgressEvent::Drift {
                        resource: resource.name.clone(),
                        detail: String::from("no longer exists"),
                    });
                    RefreshStatus::Vanished
                }
                LiveRead::Failed(e) => {
                    let kind = e.kind();
                    warn!("Failed to read {}: {e}", resource.name);
                    if kind.aborts_pass() && report.aborted.is_none() {
                        report.aborted = Some(PassAbort {
                            kind,
                            reason: e.to_string(),
                        });
                    }
                    RefreshStatus::Unreadable {
                        reason: e.to_string(),
                        kind,
                    }
                }
                LiveRead::NotChecked => RefreshStatus::NotChecked {
                    reason: String::from("cancelled"),
                },
            };
            report.entries.push(RefreshEntry {
                name: resource.name.clone(),
                type_name: resource.type_name.clone(),
                status,
            });
        }

        info!("{report}");
        report
    }

    async fn read_live(
        &self,
        resource: &ResourceState,
        creds: &dyn CredentialProvider,
        cancel: &CancellationToken,
    ) -> LiveRead {
        if cancel.is_cancelled() {
            return LiveRead::NotChecked;
        }
        let read = async {
            let adapter = self.registry.resolve(&resource.type_name)?;
            let cred = creds.credential().await?;
            adapter.read(&resource.provider_id, &cred).await
        };
        match read.await {
            Ok(Some(live)) => LiveRead::Found(live),
            Ok(None) => LiveRead::Gone,
            Err(WardenError::Provider(e)) if e.is_not_found() => LiveRead::Gone,
            Err(e) => LiveRead::Failed(e),
        }
    }

    /// Records live values for a resource that still exists.
    fn fold_live(
        &self,
        state: &mut StackState,
        resource: &ResourceState,
        live: PropertyMap,
        sink: &dyn ProgressSink,
    ) -> RefreshStatus {
        let drifted: Vec<String> = resource
            .properties
            .iter()
            .filter(|(key, value)| {
                !resource.is_sensitive(key) && live.get(key.as_str()).is_some_and(|l| l != *value)
            })
            .map(|(key, _)| key.clone())
            .collect();

        if drifted.is_empty() && live == resource.outputs {
            debug!("{} is in sync", resource.name);
            return RefreshStatus::InSync;
        }

        let mut updated = resource.clone();
        for key in &drifted {
            if let Some(value) = live.get(key) {
                updated.properties.insert(key.clone(), value.clone());
            }
        }
        updated.outputs = live;
        updated.updated_at = Utc::now();

        let status = if drifted.is_empty() {
            RefreshStatus::OutputsUpdated
        } else {
            updated.fingerprint = self.diff_engine.fingerprint(&updated.to_spec());
            warn!("{} drifted: {}", resource.name, drifted.join(", "));
            sink.emit(ProgressEvent::Drift {
                resource: resource.name.clone(),
                detail: format!("changed outside the engine: {}", drifted.join(", ")),
            });
            RefreshStatus::Drifted { fields: drifted }
        };
        state.record(updated);
        status
    }
}

impl RefreshReport {
    /// Returns true if every resource was read and nothing aborted.
    #[must_use]
    pub fn success(&self) -> bool {
        self.aborted.is_none()
            && !self.cancelled
            && self.entries.iter().all(|e| {
                !matches!(
                    e.status,
                    RefreshStatus::Unreadable { .. } | RefreshStatus::NotChecked { .. }
                )
            })
    }

    /// Names of resources whose record changed.
    #[must_use]
    pub fn changed(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.status,
                    RefreshStatus::OutputsUpdated
                        | RefreshStatus::Drifted { .. }
                        | RefreshStatus::Vanished
                )
            })
            .map(|e| e.name.as_str())
            .collect()
    }

    /// Looks up the entry for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RefreshEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl std::fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "in sync"),
            Self::OutputsUpdated => write!(f, "outputs updated"),
            Self::Drifted { fields } => write!(f, "drifted ({})", fields.join(", ")),
            Self::Vanished => write!(f, "vanished"),
            Self::Unreadable { reason, kind } => write!(f, "unreadable ({kind}): {reason}"),
            Self::NotChecked { reason } => write!(f, "not checked: {reason}"),
        }
    }
}

impl std::fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Refreshed {} resources: {} changed",
            self.entries.len(),
            self.changed().len()
        )
    }
}
