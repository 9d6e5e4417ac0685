//! Reconciler for converging provisioned state to the description.
//!
//! This module ties the pieces together: it builds the resource graph,
//! loads the recorded state, plans, and drives the executor under the state
//! lock.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{SpecHasher, StackDescription};
use crate::error::{ApplyError, ConfigError, PlanError, Result, StackError};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{ApplyReport, DiffEngine, Plan, PlanExecutor};
use crate::provider::Provider;
use crate::state::{
    ApplyHistoryEntry, ApplyOperation, LockInfo, ProvisionedState, StateStore, generate_holder_id,
};

/// Reconciler for one stack.
pub struct Reconciler<'a, S: StateStore> {
    /// Stack description.
    description: &'a StackDescription,
    /// State store.
    state_store: &'a S,
    /// Provisioning collaborator.
    provider: Arc<dyn Provider>,
    /// Description hasher.
    hasher: SpecHasher,
    /// Graph builder.
    builder: GraphBuilder,
    /// Diff engine.
    diff_engine: DiffEngine,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        description: &'a StackDescription,
        state_store: &'a S,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            description,
            state_store,
            provider,
            hasher: SpecHasher::new(),
            builder: GraphBuilder::new(),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Builds the resource graph of the description.
    ///
    /// # Errors
    ///
    /// Returns a graph error for unknown references, duplicates or cycles.
    pub fn graph(&self) -> Result<ResourceGraph> {
        self.builder.build(self.description)
    }

    /// Loads the recorded state, or an empty state for a new stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or belongs to another
    /// stack.
    pub async fn load_state(&self) -> Result<ProvisionedState> {
        let stack = self.description.qualified_name();

        match self.state_store.load().await? {
            Some(state) if state.stack != stack => Err(StackError::Config(ConfigError::validation(
                format!(
                    "State belongs to stack '{}' but the description declares '{stack}'",
                    state.stack
                ),
                "stack",
            ))),
            Some(state) => Ok(state),
            None => Ok(ProvisionedState::new(&stack)),
        }
    }

    /// Computes the plan converging the recorded state to the description.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the state cannot be loaded
    /// or the plan has conflicts.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.graph()?;
        let state = self.load_state().await?;
        let description_hash = self.hasher.hash_description(self.description);

        let diff = self.diff_engine.compute_diff(&graph, &state);
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );

        Plan::from_diff(&diff, &graph, &state, &description_hash)
    }

    /// Computes the plan deleting every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn destroy_plan(&self) -> Result<Plan> {
        let state = self.load_state().await?;
        Plan::destroy(&state, &self.hasher.hash_description(self.description))
    }

    /// Applies a plan under the state lock.
    ///
    /// Returns the report even when some operations failed; the state then
    /// holds exactly the operations that succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, the plan is stale, the
    /// run was cancelled before it started, or state could not be persisted.
    pub async fn apply(&self, plan: Plan, cancel: &CancellationToken) -> Result<ApplyReport> {
        self.locked("apply", ApplyOperation::Apply, plan, cancel).await
    }

    /// Deletes every recorded resource under the state lock.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::apply`].
    pub async fn destroy(&self, cancel: &CancellationToken) -> Result<ApplyReport> {
        let plan = self.destroy_plan().await?;
        self.locked("destroy", ApplyOperation::Destroy, plan, cancel).await
    }

    async fn locked(
        &self,
        label: &str,
        operation: ApplyOperation,
        plan: Plan,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        let lock = self.acquire_lock(label).await?;
        let result = self.run(operation, plan, cancel).await;

        if let Err(e) = self.state_store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }

        result
    }

    async fn acquire_lock(&self, label: &str) -> Result<LockInfo> {
        let holder = generate_holder_id();
        let lock = self.state_store.acquire_lock(&holder, label).await?;
        debug!("Holding {} state lock as {holder}", self.state_store.backend_type());
        Ok(lock)
    }

    async fn run(
        &self,
        operation: ApplyOperation,
        plan: Plan,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        let mut state = self.load_state().await?;

        if state.serial != plan.state_serial {
            return Err(StackError::Plan(PlanError::StalePlan {
                planned: plan.state_serial,
                current: state.serial,
            }));
        }

        if plan.is_empty() {
            info!("No changes required; state is converged");
        }

        let description_hash = plan.description_hash.clone();
        let executor = PlanExecutor::new(Arc::clone(&self.provider), &self.description.apply);
        let report = match executor.execute(plan, &mut state, self.state_store, cancel).await {
            Ok(report) => report,
            Err(e @ StackError::Apply(ApplyError::Cancelled)) => return Err(e),
            Err(e) => {
                let entry = ApplyHistoryEntry::new(operation, &description_hash, Vec::new())
                    .with_failure(&e.to_string());
                state.add_history(entry);
                if let Err(save_error) = self.state_store.save(&state).await {
                    error!("Failed to record apply history: {save_error}");
                }
                return Err(e);
            }
        };

        let mut entry =
            ApplyHistoryEntry::new(operation, &description_hash, report.succeeded());
        entry.failed = report.failed();
        entry.skipped = report.skipped();
        entry.not_started = report.not_started();

        if let Some(partial) = report.partial_error() {
            entry = entry.with_failure(&partial.to_string());
        } else if operation == ApplyOperation::Apply {
            state.description_hash = description_hash;
        }

        state.add_history(entry);
        self.state_store
            .save(&state)
            .await
            .map_err(StackError::after_mutation)?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptionParser;
    use crate::error::StateError;
    use crate::planner::OpKind;
    use crate::provider::{InjectedFailure, SandboxProvider};
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    fn description(cidr: &str) -> StackDescription {
        let yaml = format!(
            r"
version: 1
stack:
  prefix: demo
resources:
  vpc:
    type: network
    properties: {{ cidr: {cidr} }}
  cluster:
    type: cluster
    properties: {{ network: {{ ref: vpc.id }} }}
"
        );
        DescriptionParser::new().parse_yaml(&yaml, None).unwrap()
    }

    #[tokio::test]
    async fn test_apply_then_plan_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        let sandbox: Arc<dyn Provider> = Arc::new(SandboxProvider::new());
        let description = description("10.0.0.0/16");
        let reconciler = Reconciler::new(&description, &store, sandbox);

        let plan = reconciler.plan().await.unwrap();
        assert_eq!(plan.count(OpKind::Create), 2);

        let description_hash = plan.description_hash.clone();
        let report = reconciler.apply(plan, &CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert!(!store.is_locked().await.unwrap());

        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].success);
        assert_eq!(state.description_hash, description_hash);

        assert!(reconciler.plan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        let sandbox: Arc<dyn Provider> = Arc::new(SandboxProvider::new());
        let description = description("10.0.0.0/16");
        let reconciler = Reconciler::new(&description, &store, sandbox);

        let plan = reconciler.plan().await.unwrap();
        reconciler.apply(plan.clone(), &CancellationToken::new()).await.unwrap();

        let err = reconciler.apply(plan, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StackError::Plan(PlanError::StalePlan { .. })));
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_apply_is_recorded_in_history() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        let sandbox = Arc::new(SandboxProvider::new());
        sandbox.inject_failure("cluster", InjectedFailure::Permanent).await;
        let description = description("10.0.0.0/16");
        let reconciler = Reconciler::new(&description, &store, sandbox.clone());

        let plan = reconciler.plan().await.unwrap();
        let report = reconciler.apply(plan, &CancellationToken::new()).await.unwrap();

        assert!(!report.is_success());
        let state = store.load().await.unwrap().unwrap();
        assert_eq!(state.names(), vec!["vpc"]);
        assert!(!state.history[0].success);
        assert_eq!(state.history[0].failed, vec!["cluster/cluster"]);
        assert!(state.description_hash.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        let sandbox = Arc::new(SandboxProvider::new());
        let description = description("10.0.0.0/16");
        let reconciler = Reconciler::new(&description, &store, sandbox.clone());

        let plan = reconciler.plan().await.unwrap();
        reconciler.apply(plan, &CancellationToken::new()).await.unwrap();

        let report = reconciler.destroy(&CancellationToken::new()).await.unwrap();
        assert!(report.is_success());
        assert!(sandbox.resources().await.is_empty());

        let state = store.load().await.unwrap().unwrap();
        assert!(state.is_empty());
        assert_eq!(state.history.last().unwrap().operation, ApplyOperation::Destroy);
    }

    #[tokio::test]
    async fn test_state_of_another_stack_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        store.save(&ProvisionedState::new("other-prod")).await.unwrap();

        let description = description("10.0.0.0/16");
        let reconciler = Reconciler::new(&description, &store, Arc::new(SandboxProvider::new()));

        let err = reconciler.plan().await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_apply_against_held_lock_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        let sandbox = Arc::new(SandboxProvider::new());
        let description = description("10.0.0.0/16");
        let reconciler = Reconciler::new(&description, &store, sandbox.clone());
        let plan = reconciler.plan().await.unwrap();

        store.acquire_lock("ci-runner", "apply").await.unwrap();
        let err = reconciler.apply(plan, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, StackError::State(StateError::LockedByOther { .. })));
        assert_eq!(err.exit_code(), 1);
        assert!(sandbox.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_state_fails_planning_with_one() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(dir.path());
        std::fs::write(dir.path().join("state.json"), "{ not json").unwrap();

        let description = description("10.0.0.0/16");
        let reconciler = Reconciler::new(&description, &store, Arc::new(SandboxProvider::new()));

        let err = reconciler.plan().await.unwrap_err();
        assert!(matches!(err, StackError::State(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
