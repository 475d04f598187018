//! Lifecycle orchestration for `up`, `refresh` and `destroy`.
//!
//! Every mutating pass runs the same state machine: take the stack lock,
//! obtain a credential, load state, refresh or plan and apply, persist, and
//! release the lock. The lock is renewed in the background while the pass
//! runs and released on every exit path, including a panic inside the pass.

use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::StackConfig;
use crate::credentials::CredentialProvider;
use crate::error::{ErrorKind, Result};
use crate::events::{LifecyclePhase, NoopSink, PassStatus, ProgressEvent, ProgressSink};
use crate::planner::{DependencyGraph, ExecutionPlan, ExecutionResult, OperationKind};
use crate::provider::ProviderRegistry;
use crate::reconciler::{ReconciliationEngine, RefreshReport};
use crate::state::{HistoryEntry, LockInfo, LockKeeper, Operation, StackState, StateStore};

/// Runs lifecycle verbs against one stack.
pub struct Orchestrator {
    config: StackConfig,
    store: Arc<dyn StateStore>,
    credentials: Arc<dyn CredentialProvider>,
    engine: ReconciliationEngine,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    lock_timeout: Duration,
    refresh_before_up: bool,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    /// Verb that ran.
    pub operation: Operation,
    /// Stack identifier.
    pub stack: String,
    /// Refresh results, if a refresh ran.
    pub refresh: Option<RefreshReport>,
    /// Per-operation results. Empty for `refresh`.
    pub execution: ExecutionResult,
    /// Stored sequence after the pass.
    pub sequence: u64,
    /// True when `destroy` removed the stored state.
    pub state_removed: bool,
}

impl Orchestrator {
    /// Creates an orchestrator for the stack described by `config`.
    #[must_use]
    pub fn new(
        config: StackConfig,
        store: Arc<dyn StateStore>,
        credentials: Arc<dyn CredentialProvider>,
        registry: ProviderRegistry,
    ) -> Self {
        let engine = ReconciliationEngine::from_config(registry, &config.engine);
        let lock_timeout = Duration::from_secs(config.engine.lock_timeout_secs);
        let refresh_before_up = config.engine.refresh_before_up;
        Self {
            config,
            store,
            credentials,
            engine,
            sink: Arc::new(NoopSink),
            cancel: CancellationToken::new(),
            lock_timeout,
            refresh_before_up,
        }
    }

    /// Sends progress events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns a handle that cancels running passes.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the stack identifier.
    #[must_use]
    pub fn stack_id(&self) -> String {
        self.config.stack_id()
    }

    /// Converges the stack toward the configured resource graph.
    ///
    /// # Errors
    ///
    /// Returns an error for anything that aborts the pass: configuration,
    /// credentials, lock timeout, sequence conflict or a dependency cycle.
    /// Per-resource failures are reported in the returned report instead.
    pub async fn up(&self) -> Result<PassReport> {
        self.run(Operation::Up).await
    }

    /// Reads live values into stored state without changing any resource.
    ///
    /// # Errors
    ///
    /// Same as [`up`](Self::up).
    pub async fn refresh(&self) -> Result<PassReport> {
        self.run(Operation::Refresh).await
    }

    /// Deletes every recorded resource, then the stored state itself.
    ///
    /// # Errors
    ///
    /// Same as [`up`](Self::up), plus `NotFound` when the stack was never
    /// stored.
    pub async fn destroy(&self) -> Result<PassReport> {
        self.run(Operation::Destroy).await
    }

    /// Computes the plan `up` would execute. Takes no lock, obtains no
    /// credential and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or the graph has a cycle.
    pub async fn preview(&self) -> Result<ExecutionPlan> {
        let state = self.store.load(&self.stack_id()).await?;
        self.engine.plan(&self.config.resources, &state)
    }

    /// Computes the plan `destroy` would execute against stored state.
    ///
    /// `destroy` refreshes before planning, so resources deleted out of band
    /// since the last pass appear here but are skipped by `destroy`.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn preview_destroy(&self) -> Result<ExecutionPlan> {
        let state = self.store.load(&self.stack_id()).await?;
        self.engine.plan_destroy(&state)
    }

    /// Loads the stored state without locking.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn stored_state(&self) -> Result<StackState> {
        self.store.load(&self.stack_id()).await
    }

    /// Returns the current lock holder, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record cannot be read.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.store.lock_info(&self.stack_id()).await
    }

    /// Removes the stack lock regardless of holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record cannot be removed.
    pub async fn force_unlock(&self) -> Result<bool> {
        self.store.force_unlock(&self.stack_id()).await
    }

    async fn run(&self, operation: Operation) -> Result<PassReport> {
        let stack = self.stack_id();
        info!("Starting {operation} for stack '{stack}'");

        self.phase(LifecyclePhase::Locking);
        let handle = match self.store.lock(&stack, self.lock_timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Could not lock '{stack}': {e}");
                self.phase(LifecyclePhase::Unlocked(PassStatus::Failed));
                return Err(e);
            }
        };
        let lock_id = handle.lock_id().to_string();

        // Losing the lock stops this pass only, not the caller's token.
        let cancel = self.cancel.child_token();
        let keeper = LockKeeper::spawn(
            self.store.clone(),
            stack.clone(),
            lock_id.clone(),
            LockKeeper::period_for(self.store.lock_expiry()),
            cancel.clone(),
        );

        let outcome = AssertUnwindSafe(self.locked_pass(operation, &stack, &lock_id, &cancel))
            .catch_unwind()
            .await;
        keeper.stop().await;
        let released = self.store.release(handle).await;

        match outcome {
            Err(panic) => {
                error!("{operation} panicked; lock released");
                self.phase(LifecyclePhase::Unlocked(PassStatus::Failed));
                std::panic::resume_unwind(panic)
            }
            Ok(Err(e)) => {
                if let Err(release_err) = released {
                    warn!("Failed to release lock {lock_id}: {release_err}");
                }
                error!("{operation} aborted: {e}");
                self.phase(LifecyclePhase::Unlocked(PassStatus::Failed));
                Err(e)
            }
            Ok(Ok(report)) => {
                if let Err(e) = released {
                    self.phase(LifecyclePhase::Unlocked(PassStatus::Failed));
                    return Err(e);
                }
                let status = if report.success() {
                    PassStatus::Done
                } else {
                    PassStatus::Failed
                };
                info!("{operation} finished: {}", report.execution);
                self.phase(LifecyclePhase::Unlocked(status));
                Ok(report)
            }
        }
    }

    /// Everything that happens while the lock is held.
    async fn locked_pass(
        &self,
        operation: Operation,
        stack: &str,
        lock_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PassReport> {
        let desired = &self.config.resources;
        if operation == Operation::Up {
            DependencyGraph::from_specs(desired).topological_order()?;
        }

        let creds = self.credentials.as_ref();
        creds.credential().await?;
        self.phase(LifecyclePhase::CredentialAcquired);

        let mut state = self.store.load(stack).await?;
        if state.project.is_empty() {
            state.project.clone_from(&self.config.project.name);
        }
        let loaded_sequence = state.sequence;
        let sink = self.sink.as_ref();

        let mut refresh = None;
        let mut execution = ExecutionResult::default();
        match operation {
            Operation::Refresh => {
                self.phase(LifecyclePhase::Refreshing);
                refresh = Some(self.engine.refresh(&mut state, creds, sink, cancel).await);
            }
            Operation::Up | Operation::Destroy => {
                if self.refresh_before_up && !state.is_empty() {
                    self.phase(LifecyclePhase::Refreshing);
                    let report = self.engine.refresh(&mut state, creds, sink, cancel).await;
                    execution.aborted.clone_from(&report.aborted);
                    execution.cancelled = report.cancelled;
                    refresh = Some(report);
                }
                if execution.aborted.is_none() && !execution.cancelled {
                    self.phase(LifecyclePhase::Planning);
                    let plan = if operation == Operation::Up {
                        self.engine.plan(desired, &state)?
                    } else {
                        self.engine.plan_destroy(&state)?
                    };
                    info!("{plan}");
                    self.phase(LifecyclePhase::Applying);
                    execution = self.engine.apply(&plan, &mut state, creds, sink, cancel).await;
                }
            }
        }

        let mut report = PassReport {
            operation,
            stack: stack.to_string(),
            refresh,
            execution,
            sequence: state.sequence,
            state_removed: false,
        };

        if operation == Operation::Destroy && report.success() && state.is_empty() {
            self.store.delete(stack).await?;
            info!("Removed state for '{stack}'");
            report.state_removed = true;
        } else {
            state.add_history(Self::history_entry(&report));
            state.lock_token = Some(lock_id.to_string());
            self.store.save(stack, &state, loaded_sequence).await?;
        }
        self.phase(LifecyclePhase::Persisted);

        Ok(report)
    }

    fn history_entry(report: &PassReport) -> HistoryEntry {
        let touched: Vec<String> = report
            .execution
            .results
            .iter()
            .filter(|r| r.kind != OperationKind::Noop)
            .map(|r| r.name.clone())
            .chain(
                report
                    .refresh
                    .iter()
                    .flat_map(|r| r.changed().into_iter().map(ToString::to_string)),
            )
            .collect();

        if report.success() {
            HistoryEntry::new(report.operation, touched)
        } else {
            HistoryEntry::failed(report.operation, touched, &report.failure_summary())
        }
    }

    fn phase(&self, phase: LifecyclePhase) {
        info!("Phase: {phase}");
        self.sink.emit(ProgressEvent::Phase { phase });
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stack", &self.stack_id())
            .field("backend", &self.store.backend_type())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl PassReport {
    /// Returns true if every resource ended succeeded or unchanged.
    #[must_use]
    pub fn success(&self) -> bool {
        self.refresh.as_ref().is_none_or(RefreshReport::success) && self.execution.success()
    }

    /// Error kind that best describes a failed pass.
    #[must_use]
    pub fn failure_kind(&self) -> Option<ErrorKind> {
        if self.success() {
            return None;
        }
        if let Some(abort) = &self.execution.aborted {
            return Some(abort.kind);
        }
        if self.execution.cancelled {
            return Some(ErrorKind::Cancelled);
        }
        if let Some(failure) = self.execution.failures().first()
            && let crate::planner::OperationOutcome::Failed { kind, .. } = failure.outcome
        {
            return Some(kind);
        }
        Some(ErrorKind::Provider)
    }

    /// One line naming what went wrong.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        if let Some(abort) = &self.execution.aborted {
            return format!("aborted: {}", abort.reason);
        }
        if self.execution.cancelled {
            return String::from("cancelled");
        }
        let failed: Vec<&str> = self
            .execution
            .failures()
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        if failed.is_empty() {
            format!("{} skipped", self.execution.skipped())
        } else {
            format!("failed: {}", failed.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, ResourceSpec};
    use crate::credentials::FederatedCredential;
    use crate::events::ChannelSink;
    use crate::planner::OperationOutcome;
    use crate::provider::testing::{FakeProvider, test_credential};
    use crate::provider::{Created, ProviderAdapter};
    use crate::state::LocalStateStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct PanickingProvider;

    #[async_trait]
    impl ProviderAdapter for PanickingProvider {
        async fn create(&self, _spec: &ResourceSpec, _cred: &FederatedCredential) -> Result<Created> {
            panic!("adapter bug");
        }

        async fn read(
            &self,
            _provider_id: &str,
            _cred: &FederatedCredential,
        ) -> Result<Option<crate::config::PropertyMap>> {
            Ok(None)
        }

        async fn update(
            &self,
            _provider_id: &str,
            _spec: &ResourceSpec,
            _cred: &FederatedCredential,
        ) -> Result<crate::config::PropertyMap> {
            panic!("adapter bug");
        }

        async fn delete(&self, _provider_id: &str, _cred: &FederatedCredential) -> Result<()> {
            Ok(())
        }
    }

    fn config(resources: Vec<ResourceSpec>) -> StackConfig {
        StackConfig {
            project: ProjectConfig {
                name: "dev".to_string(),
                stack: "create-s3-bucket".to_string(),
            },
            state: crate::config::StateConfig::default(),
            credentials: crate::config::CredentialsConfig::default(),
            engine: crate::config::EngineConfig::default(),
            resources,
        }
    }

    fn orchestrator(
        temp: &TempDir,
        resources: Vec<ResourceSpec>,
        registry: ProviderRegistry,
    ) -> Orchestrator {
        Orchestrator::new(
            config(resources),
            Arc::new(LocalStateStore::with_base_dir(temp.path())),
            Arc::new(test_credential()),
            registry,
        )
    }

    #[tokio::test]
    async fn test_up_persists_and_releases() {
        let temp = TempDir::new().unwrap();
        let fake = FakeProvider::new();
        let registry = ProviderRegistry::new().with("bucket", Arc::new(fake.clone()));
        let (sink, mut rx) = ChannelSink::channel();
        let orch = orchestrator(&temp, vec![ResourceSpec::new("bucket-a", "bucket")], registry)
            .with_sink(Arc::new(sink));

        let report = orch.up().await.unwrap();
        assert!(report.success());
        assert_eq!(report.sequence, 1);
        assert!(orch.lock_info().await.unwrap().is_none());

        let stored = orch.stored_state().await.unwrap();
        assert_eq!(stored.project, "dev");
        assert_eq!(stored.history.len(), 1);
        assert!(stored.lock_token.is_some());

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Phase { phase } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                LifecyclePhase::Locking,
                LifecyclePhase::CredentialAcquired,
                LifecyclePhase::Planning,
                LifecyclePhase::Applying,
                LifecyclePhase::Persisted,
                LifecyclePhase::Unlocked(PassStatus::Done),
            ]
        );
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_credentials() {
        let temp = TempDir::new().unwrap();
        let fake = FakeProvider::new();
        let registry = ProviderRegistry::new().with("bucket", Arc::new(fake.clone()));
        let resources = vec![
            ResourceSpec::new("a", "bucket").depends_on("b"),
            ResourceSpec::new("b", "bucket").depends_on("a"),
        ];
        let orch = orchestrator(&temp, resources, registry);

        let err = orch.up().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicGraph);
        assert!(fake.calls().is_empty());
        assert!(orch.lock_info().await.unwrap().is_none());
        assert_eq!(orch.stored_state().await.unwrap().sequence, 0);
    }

    #[tokio::test]
    async fn test_panic_releases_lock() {
        let temp = TempDir::new().unwrap();
        let registry = ProviderRegistry::new().with("bucket", Arc::new(PanickingProvider));
        let orch = orchestrator(&temp, vec![ResourceSpec::new("bucket-a", "bucket")], registry);

        let outcome = AssertUnwindSafe(orch.up()).catch_unwind().await;
        assert!(outcome.is_err());
        assert!(orch.lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_times_out() {
        let temp = TempDir::new().unwrap();
        let registry = ProviderRegistry::new().with("bucket", Arc::new(FakeProvider::new()));
        let mut cfg = config(vec![]);
        cfg.engine.lock_timeout_secs = 0;
        let store = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let orch = Orchestrator::new(cfg, store.clone(), Arc::new(test_credential()), registry);

        let handle = store
            .lock(&orch.stack_id(), Duration::from_secs(1))
            .await
            .unwrap();
        let err = orch.up().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        store.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_removes_state() {
        let temp = TempDir::new().unwrap();
        let fake = FakeProvider::new();
        let registry = ProviderRegistry::new().with("bucket", Arc::new(fake.clone()));
        let orch = orchestrator(&temp, vec![ResourceSpec::new("bucket-a", "bucket")], registry);

        orch.up().await.unwrap();
        let report = orch.destroy().await.unwrap();
        assert!(report.state_removed);
        assert_eq!(fake.live_count(), 0);
        assert!(orch.stored_state().await.unwrap().is_empty());

        let err = orch.destroy().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_destroy_skips_resources_deleted_out_of_band() {
        let temp = TempDir::new().unwrap();
        let fake = FakeProvider::new();
        let registry = ProviderRegistry::new().with("bucket", Arc::new(fake.clone()));
        let resources = vec![
            ResourceSpec::new("bucket-a", "bucket"),
            ResourceSpec::new("bucket-b", "bucket"),
        ];
        let orch = orchestrator(&temp, resources, registry);

        orch.up().await.unwrap();
        let stored = orch.stored_state().await.unwrap();
        fake.vanish(&stored.get("bucket-b").unwrap().provider_id);
        fake.clear_calls();

        let preview = orch.preview_destroy().await.unwrap();
        assert_eq!(preview.len(), 2);

        let report = orch.destroy().await.unwrap();
        assert!(report.success());
        assert!(report.state_removed);
        let refresh = report.refresh.as_ref().unwrap();
        assert_eq!(
            refresh.get("bucket-b").unwrap().status,
            crate::reconciler::RefreshStatus::Vanished
        );
        assert!(report.execution.get("bucket-b").is_none());

        let deletes: Vec<String> = fake
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("delete"))
            .collect();
        assert_eq!(deletes, vec!["delete bucket-a".to_string()]);
        assert_eq!(fake.live_count(), 0);
    }

    #[tokio::test]
    async fn test_long_pass_keeps_its_lock() {
        let temp = TempDir::new().unwrap();
        let expiry = Duration::from_millis(200);
        let fake = FakeProvider::new().with_delay(Duration::from_millis(700));
        let registry = ProviderRegistry::new().with("bucket", Arc::new(fake.clone()));
        let store = Arc::new(LocalStateStore::with_base_dir(temp.path()).with_lock_expiry(expiry));
        let rival = LocalStateStore::with_base_dir(temp.path()).with_lock_expiry(expiry);
        let orch = Orchestrator::new(
            config(vec![ResourceSpec::new("bucket-a", "bucket")]),
            store,
            Arc::new(test_credential()),
            registry,
        );
        let stack = orch.stack_id();

        // Contends well after the first expiry window has passed.
        let contender = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            rival.lock(&stack, Duration::from_millis(300)).await
        };
        let (report, contended) = tokio::join!(orch.up(), contender);

        assert!(report.unwrap().success());
        assert_eq!(contended.unwrap_err().kind(), ErrorKind::LockTimeout);
        assert!(orch.lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_failure_is_persisted() {
        let temp = TempDir::new().unwrap();
        let fake = FakeProvider::new();
        fake.fail_on("role-a");
        let registry = ProviderRegistry::new().with("bucket", Arc::new(fake.clone()));
        let resources = vec![
            ResourceSpec::new("bucket-a", "bucket").depends_on("role-a"),
            ResourceSpec::new("role-a", "bucket"),
            ResourceSpec::new("queue", "bucket"),
        ];
        let orch = orchestrator(&temp, resources, registry);

        let report = orch.up().await.unwrap();
        assert!(!report.success());
        assert_eq!(report.failure_kind(), Some(ErrorKind::Provider));
        assert_eq!(report.failure_summary(), "failed: role-a");
        assert!(matches!(
            report.execution.get("bucket-a").unwrap().outcome,
            OperationOutcome::Skipped { .. }
        ));

        let stored = orch.stored_state().await.unwrap();
        assert!(stored.get("queue").is_some());
        assert!(stored.get("bucket-a").is_none());
        assert!(!stored.history[0].success);
    }

    #[tokio::test]
    async fn test_preview_changes_nothing() {
        let temp = TempDir::new().unwrap();
        let fake = FakeProvider::new();
        let registry = ProviderRegistry::new().with("bucket", Arc::new(fake.clone()));
        let orch = orchestrator(&temp, vec![ResourceSpec::new("bucket-a", "bucket")], registry);

        let plan = orch.preview().await.unwrap();
        assert_eq!(plan.summary(), vec![(OperationKind::Create, "bucket-a")]);
        assert!(fake.calls().is_empty());
        assert!(orch.lock_info().await.unwrap().is_none());
    }
}
