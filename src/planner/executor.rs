//! Plan executor for applying provisioning plans.
//!
//! A single coordinator owns the provisioned state. It splits every planned
//! operation into steps (a teardown, a build, or both for a replacement),
//! releases a step to a bounded [`JoinSet`] once all of its prerequisites
//! succeeded, and commits one state change per completed step before
//! releasing anything else.
//!
//! Provider calls run in worker tasks. Each call carries an idempotency
//! token, is bounded by a deadline and is retried with exponential backoff
//! while it fails transiently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ApplySettings, Reference, SpecHasher};
use crate::error::{ApplyError, ProviderError, Result, StackError};
use crate::graph::ResourceSpec;
use crate::provider::{ProvisionedResource, Provider, ResolvedResource};
use crate::state::{ProvisionedState, ResourceRecord, StateChange, StateStore};

use super::plan::{OpKind, Plan, PlanOp};

/// Retry and deadline policy for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts per call.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt.
    pub base_backoff: Duration,
    /// Upper bound for any single backoff.
    pub max_backoff: Duration,
    /// Deadline for a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Builds a policy from apply settings.
    #[must_use]
    pub const fn from_settings(settings: &ApplySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_backoff: Duration::from_millis(settings.base_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            timeout: Duration::from_secs(settings.operation_timeout_secs),
        }
    }

    /// Returns the backoff after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&ApplySettings::default())
    }
}

/// Status of a planned operation during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    /// Waiting for prerequisites.
    Pending,
    /// A provider call is running.
    InProgress,
    /// Completed and committed to state.
    Succeeded,
    /// Failed permanently or ran out of attempts.
    Failed,
    /// Not attempted because something it depends on failed.
    Skipped,
    /// Not attempted because the run halted or was cancelled.
    NotStarted,
}

/// Outcome of one planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    /// Resource name.
    pub resource: String,
    /// `<type>/<name>` identity.
    pub identity: String,
    /// Planned kind.
    pub kind: OpKind,
    /// Final status.
    pub status: OpStatus,
    /// Provider calls made, retries included.
    pub attempts: u32,
    /// Provider id after the operation (or of the removed resource).
    pub provider_id: Option<String>,
    /// Error message if the operation failed.
    pub error: Option<String>,
}

/// Report of an apply run.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
    /// One outcome per actionable operation, in plan order.
    pub outcomes: Vec<OpOutcome>,
}

impl ApplyReport {
    fn identities(&self, status: OpStatus) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status == status)
            .map(|o| o.identity.clone())
            .collect()
    }

    /// Identities of the operations that succeeded.
    #[must_use]
    pub fn succeeded(&self) -> Vec<String> {
        self.identities(OpStatus::Succeeded)
    }

    /// Identities of the operations that failed.
    #[must_use]
    pub fn failed(&self) -> Vec<String> {
        self.identities(OpStatus::Failed)
    }

    /// Identities of the operations skipped because of a failure.
    #[must_use]
    pub fn skipped(&self) -> Vec<String> {
        self.identities(OpStatus::Skipped)
    }

    /// Identities of the operations never started.
    #[must_use]
    pub fn not_started(&self) -> Vec<String> {
        self.identities(OpStatus::NotStarted)
    }

    /// Returns true if every operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == OpStatus::Succeeded)
    }

    /// Returns the outcome for a resource.
    #[must_use]
    pub fn outcome(&self, resource: &str) -> Option<&OpOutcome> {
        self.outcomes.iter().find(|o| o.resource == resource)
    }

    /// Returns the partial-apply error describing this run, if it did not
    /// fully succeed.
    #[must_use]
    pub fn partial_error(&self) -> Option<ApplyError> {
        (!self.is_success()).then(|| ApplyError::PartiallyApplied {
            succeeded: self.succeeded(),
            failed: self.failed(),
            skipped: self.skipped(),
            not_started: self.not_started(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    /// Remove the existing resource.
    Teardown,
    /// Create or update the desired resource.
    Build,
}

#[derive(Debug)]
struct Step {
    op: usize,
    kind: StepKind,
    prerequisites: Vec<usize>,
    dependents: Vec<usize>,
    status: OpStatus,
    attempts: u32,
    provider_id: Option<String>,
    error: Option<String>,
}

/// A provider call ready to run in a worker.
#[derive(Debug)]
enum Call {
    Create {
        resource: ResolvedResource,
    },
    Update {
        provider_id: String,
        resource: ResolvedResource,
    },
    Delete {
        provider_id: String,
    },
}

#[derive(Debug)]
enum CallOutput {
    Provisioned(ProvisionedResource),
    Deleted,
}

#[derive(Debug)]
struct StepResult {
    step: usize,
    attempts: u32,
    result: Result<CallOutput>,
}

impl Call {
    const fn operation(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    async fn invoke(&self, provider: &dyn Provider, token: &str) -> Result<CallOutput> {
        match self {
            Self::Create { resource } => provider
                .create(resource, token)
                .await
                .map(CallOutput::Provisioned),
            Self::Update {
                provider_id,
                resource,
            } => provider
                .update(provider_id, resource, token)
                .await
                .map(CallOutput::Provisioned),
            Self::Delete { provider_id } => provider
                .delete(provider_id, token)
                .await
                .map(|()| CallOutput::Deleted),
        }
    }
}

/// Runs one provider call to completion: deadline per attempt, retries on
/// transient failures, `NotFound` on delete treated as done.
///
/// Cancellation during a backoff ends the call with `ApplyError::Cancelled`.
async fn run_call(
    provider: Arc<dyn Provider>,
    call: Call,
    token: String,
    identity: String,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> (u32, Result<CallOutput>) {
    let operation = call.operation();
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(resource = %identity, operation, attempt, "Calling provider");

        let outcome = tokio::time::timeout(policy.timeout, call.invoke(provider.as_ref(), &token))
            .await
            .unwrap_or_else(|_| {
                Err(StackError::Provider(ProviderError::Timeout {
                    resource: identity.clone(),
                    operation: operation.to_string(),
                    timeout_secs: policy.timeout.as_secs(),
                }))
            });

        let err = match outcome {
            Ok(output) => return (attempt, Ok(output)),
            Err(StackError::Provider(ProviderError::NotFound { provider_id }))
                if matches!(call, Call::Delete { .. }) =>
            {
                info!("{identity} ({provider_id}) is already gone");
                return (attempt, Ok(CallOutput::Deleted));
            }
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= policy.max_attempts {
            return (attempt, Err(err));
        }

        let delay = err.retry_delay_secs().map_or_else(
            || policy.backoff(attempt),
            |secs| Duration::from_secs(secs).min(policy.max_backoff),
        );
        warn!(
            "{operation} {identity} failed (attempt {attempt}/{}): {err}; retrying in {}ms",
            policy.max_attempts,
            delay.as_millis()
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                info!("{operation} {identity} abandoned during backoff after: {err}");
                return (attempt, Err(StackError::Apply(ApplyError::Cancelled)));
            }
        }
    }
}

/// Executor for provisioning plans.
pub struct PlanExecutor {
    /// Provisioning collaborator.
    provider: Arc<dyn Provider>,
    /// Maximum number of concurrent provider calls.
    concurrency: usize,
    /// Retry and deadline policy.
    policy: RetryPolicy,
    /// Derives idempotency tokens.
    hasher: SpecHasher,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("concurrency", &self.concurrency)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates an executor with the given apply settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, settings: &ApplySettings) -> Self {
        Self {
            provider,
            concurrency: settings.concurrency.max(1),
            policy: RetryPolicy::from_settings(settings),
            hasher: SpecHasher::new(),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Executes a plan, committing each completed step to `store`.
    ///
    /// The plan is consumed: it describes one transition from the state it
    /// was computed against and cannot be applied twice.
    ///
    /// Returns a report even when operations fail; use
    /// [`ApplyReport::partial_error`] to turn it into an error.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError::Cancelled` if `cancel` fired before the first
    /// operation started, or the state store error if a commit failed.
    #[instrument(skip_all, fields(stack = %plan.stack))]
    pub async fn execute<S>(
        &self,
        plan: Plan,
        state: &mut ProvisionedState,
        store: &S,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport>
    where
        S: StateStore + ?Sized,
    {
        let plan = &plan;
        let started_at = Utc::now();
        let mut steps = build_steps(plan, state);

        if cancel.is_cancelled() {
            info!("Apply cancelled before start; nothing was changed");
            return Err(StackError::Apply(ApplyError::Cancelled));
        }

        info!(
            "Applying {} operations ({} steps, concurrency {})",
            plan.actionable().count(),
            steps.len(),
            self.concurrency
        );

        let mut remaining: Vec<usize> = steps.iter().map(|s| s.prerequisites.len()).collect();
        let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| remaining[i] == 0).collect();
        let mut workers: JoinSet<StepResult> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut started = false;
        let mut halted = false;
        let mut fatal: Option<StackError> = None;

        loop {
            while !halted && workers.len() < self.concurrency {
                if cancel.is_cancelled() {
                    if !started {
                        info!("Apply cancelled before start; nothing was changed");
                        return Err(StackError::Apply(ApplyError::Cancelled));
                    }
                    warn!("Cancellation requested; waiting for in-flight operations");
                    halted = true;
                    break;
                }

                let Some(index) = ready.pop_first() else {
                    break;
                };

                let op = &plan.ops[steps[index].op];
                match self.prepare(plan, op, steps[index].kind, state) {
                    Ok((call, token)) => {
                        info!("{} {}", call.operation(), op.identity());
                        let worker = run_call(
                            Arc::clone(&self.provider),
                            call,
                            token,
                            op.identity(),
                            self.policy,
                            cancel.clone(),
                        );
                        let handle = workers.spawn(async move {
                            let (attempts, result) = worker.await;
                            StepResult {
                                step: index,
                                attempts,
                                result,
                            }
                        });
                        running.insert(handle.id(), index);
                        steps[index].status = OpStatus::InProgress;
                        started = true;
                    }
                    Err(e) => {
                        error!("{} failed: {e}", op.identity());
                        steps[index].status = OpStatus::Failed;
                        steps[index].error = Some(e.to_string());
                        halted = true;
                    }
                }
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };

            let (index, attempts, result) = match joined {
                Ok(done) => {
                    running.retain(|_, step| *step != done.step);
                    (done.step, done.attempts, done.result)
                }
                Err(join_error) => {
                    let Some(index) = running.remove(&join_error.id()) else {
                        return Err(StackError::internal(format!(
                            "Worker task failed: {join_error}"
                        )));
                    };
                    (index, 0, Err(StackError::internal(format!("Worker task failed: {join_error}"))))
                }
            };
            steps[index].attempts = attempts;

            match result {
                Ok(output) => {
                    let op = &plan.ops[steps[index].op];
                    let change = match record_change(op, steps[index].kind, output, state) {
                        Ok(change) => change,
                        Err(e) => {
                            steps[index].status = OpStatus::Failed;
                            steps[index].error = Some(e.to_string());
                            halted = true;
                            continue;
                        }
                    };

                    if let StateChange::Upsert { record } = &change {
                        steps[index].provider_id = Some(record.provider_id.clone());
                    } else {
                        steps[index].provider_id.clone_from(&op.provider_id);
                    }

                    state.apply_change(&change);
                    if let Err(e) = store.commit(state, &change).await {
                        let e = e.after_mutation();
                        error!("Failed to persist {}: {e}", op.identity());
                        steps[index].status = OpStatus::Failed;
                        steps[index].error = Some(e.to_string());
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                        halted = true;
                        continue;
                    }

                    debug!("{} step committed (serial {})", op.identity(), state.serial);
                    steps[index].status = OpStatus::Succeeded;
                    for dependent in steps[index].dependents.clone() {
                        remaining[dependent] -= 1;
                        if remaining[dependent] == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
                Err(StackError::Apply(ApplyError::Cancelled)) => {
                    warn!(
                        "{} not completed: cancelled between attempts",
                        plan.ops[steps[index].op].identity()
                    );
                    steps[index].status = OpStatus::NotStarted;
                    halted = true;
                }
                Err(e) => {
                    error!(
                        "{} failed after {attempts} attempt(s): {e}",
                        plan.ops[steps[index].op].identity()
                    );
                    steps[index].status = OpStatus::Failed;
                    steps[index].error = Some(e.to_string());
                    halted = true;
                }
            }
        }

        if !halted && steps.iter().any(|s| s.status == OpStatus::Pending) {
            error!("Apply stalled: remaining operations have unsatisfiable prerequisites");
        }
        settle(&mut steps);

        if let Some(e) = fatal {
            return Err(e);
        }

        let report = ApplyReport {
            started_at,
            finished_at: Utc::now(),
            cancelled: cancel.is_cancelled(),
            outcomes: outcomes(plan, &steps),
        };

        if report.is_success() {
            info!("Apply complete: {} operations succeeded", report.outcomes.len());
        } else {
            warn!(
                "Apply incomplete: {} succeeded, {} failed, {} skipped, {} not started",
                report.succeeded().len(),
                report.failed().len(),
                report.skipped().len(),
                report.not_started().len()
            );
        }

        Ok(report)
    }

    /// Resolves references and derives the token for one step.
    fn prepare(
        &self,
        plan: &Plan,
        op: &PlanOp,
        kind: StepKind,
        state: &ProvisionedState,
    ) -> Result<(Call, String)> {
        let identity = format!("{}/{}", plan.stack, op.identity());
        let existing_id = || {
            op.provider_id
                .clone()
                .ok_or_else(|| StackError::internal(format!("{} has no provider id", op.identity())))
        };

        if kind == StepKind::Teardown {
            let provider_id = existing_id()?;
            let token = self.hasher.idempotency_token(
                &identity,
                op.old_hash.as_deref().unwrap_or_default(),
                &format!("delete:{provider_id}"),
            );
            return Ok((Call::Delete { provider_id }, token));
        }

        let spec = op
            .spec
            .as_ref()
            .ok_or_else(|| StackError::internal(format!("{} has no desired spec", op.identity())))?;
        let resource = resolve(plan, spec, state)?;

        let (call, discriminator) = match op.kind {
            OpKind::Update => {
                let provider_id = existing_id()?;
                let discriminator = format!("update:{provider_id}");
                (Call::Update { provider_id, resource }, discriminator)
            }
            OpKind::Replace => {
                let discriminator = format!("replace:{}", existing_id()?);
                (Call::Create { resource }, discriminator)
            }
            _ => (Call::Create { resource }, String::from("create")),
        };

        let token = self
            .hasher
            .idempotency_token(&identity, &spec.spec_hash, &discriminator);
        Ok((call, token))
    }
}

/// Replaces every reference in `spec` with the output it names.
fn resolve(plan: &Plan, spec: &ResourceSpec, state: &ProvisionedState) -> Result<ResolvedResource> {
    let lookup = |r: &Reference| state.get(&r.resource).and_then(|record| record.output(&r.attribute));

    let mut properties = serde_json::Map::new();
    for (key, value) in &spec.properties {
        let resolved = value.resolve(&lookup).map_err(|unresolved| {
            let reason = if state.get(&unresolved.resource).is_some() {
                format!(
                    "'{}' did not report output '{}'",
                    unresolved.resource, unresolved.attribute
                )
            } else {
                format!("'{}' is not provisioned", unresolved.resource)
            };
            StackError::Apply(ApplyError::UnresolvedReference {
                resource: spec.id.to_string(),
                reference: unresolved.to_string(),
                reason,
            })
        })?;
        properties.insert(key.clone(), resolved);
    }

    Ok(ResolvedResource {
        stack: plan.stack.clone(),
        name: spec.name().to_string(),
        resource_type: spec.resource_type(),
        properties,
        tags: plan.tags.clone(),
    })
}

/// Turns a completed step into the state change to commit.
fn record_change(
    op: &PlanOp,
    kind: StepKind,
    output: CallOutput,
    state: &ProvisionedState,
) -> Result<StateChange> {
    match (kind, output) {
        (StepKind::Teardown, _) => Ok(StateChange::Remove {
            name: op.resource.clone(),
        }),
        (StepKind::Build, CallOutput::Provisioned(provisioned)) => {
            let spec = op
                .spec
                .as_ref()
                .ok_or_else(|| StackError::internal(format!("{} has no desired spec", op.identity())))?;

            let mut record = ResourceRecord::new(
                spec.name(),
                spec.resource_type(),
                &provisioned.provider_id,
                &spec.spec_hash,
            );
            record.properties = spec
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_canonical()))
                .collect();
            record.outputs = provisioned.outputs;
            record.dependencies.clone_from(&spec.dependencies);
            record.tags.clone_from(&spec.tags);
            if op.kind == OpKind::Update
                && let Some(existing) = state.get(spec.name())
            {
                record.created_at = existing.created_at;
            }

            Ok(StateChange::Upsert { record })
        }
        (StepKind::Build, CallOutput::Deleted) => Err(StackError::internal(format!(
            "{} build step reported a deletion",
            op.identity()
        ))),
    }
}

/// Splits the plan into steps and wires their prerequisites.
///
/// - a build waits for the builds of its dependencies and for its own teardown
/// - a teardown waits for the teardowns of the resources recorded as
///   depending on it, or for their update when they are kept
fn build_steps(plan: &Plan, state: &ProvisionedState) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut push = |op: usize, kind: StepKind| {
        steps.push(Step {
            op,
            kind,
            prerequisites: Vec::new(),
            dependents: Vec::new(),
            status: OpStatus::Pending,
            attempts: 0,
            provider_id: None,
            error: None,
        });
    };

    for (i, op) in plan.ops.iter().enumerate() {
        if op.kind == OpKind::Delete {
            push(i, StepKind::Teardown);
        }
    }
    for (i, op) in plan.ops.iter().enumerate().rev() {
        if op.kind == OpKind::Replace {
            push(i, StepKind::Teardown);
        }
    }
    for (i, op) in plan.ops.iter().enumerate() {
        if matches!(op.kind, OpKind::Create | OpKind::Update | OpKind::Replace) {
            push(i, StepKind::Build);
        }
    }

    let mut teardowns: HashMap<&str, usize> = HashMap::new();
    let mut builds: HashMap<&str, usize> = HashMap::new();
    for (index, step) in steps.iter().enumerate() {
        let name = plan.ops[step.op].resource.as_str();
        match step.kind {
            StepKind::Teardown => teardowns.insert(name, index),
            StepKind::Build => builds.insert(name, index),
        };
    }

    let mut edges = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        let op = &plan.ops[step.op];
        match step.kind {
            StepKind::Build => {
                for dependency in &op.dependencies {
                    if let Some(&b) = builds.get(dependency.as_str()) {
                        edges.push((b, index));
                    }
                }
                if let Some(&t) = teardowns.get(op.resource.as_str()) {
                    edges.push((t, index));
                }
            }
            StepKind::Teardown => {
                for dependent in state.dependents_of(&op.resource) {
                    if let Some(&t) = teardowns.get(dependent) {
                        edges.push((t, index));
                    } else if let Some(&b) = builds.get(dependent) {
                        edges.push((b, index));
                    }
                }
            }
        }
    }

    for (before, after) in edges {
        if before != after {
            steps[after].prerequisites.push(before);
            steps[before].dependents.push(after);
        }
    }

    steps
}

/// Marks steps that never ran: skipped when blocked by a failure, not
/// started otherwise.
fn settle(steps: &mut [Step]) {
    loop {
        let blocked: Vec<usize> = (0..steps.len())
            .filter(|&i| {
                steps[i].status == OpStatus::Pending
                    && steps[i].prerequisites.iter().any(|&p| {
                        matches!(steps[p].status, OpStatus::Failed | OpStatus::Skipped)
                    })
            })
            .collect();
        if blocked.is_empty() {
            break;
        }
        for i in blocked {
            steps[i].status = OpStatus::Skipped;
        }
    }

    for step in steps.iter_mut() {
        if matches!(step.status, OpStatus::Pending | OpStatus::InProgress) {
            step.status = OpStatus::NotStarted;
        }
    }
}

/// Folds step results into one outcome per actionable operation.
fn outcomes(plan: &Plan, steps: &[Step]) -> Vec<OpOutcome> {
    plan.ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.kind != OpKind::NoOp)
        .map(|(i, op)| {
            let mut own: Vec<&Step> = steps.iter().filter(|s| s.op == i).collect();
            own.sort_by_key(|s| s.kind == StepKind::Build);

            let status = if own.iter().any(|s| s.status == OpStatus::Failed) {
                OpStatus::Failed
            } else {
                own.iter()
                    .map(|s| s.status)
                    .find(|status| *status != OpStatus::Succeeded)
                    .unwrap_or(OpStatus::Succeeded)
            };

            OpOutcome {
                resource: op.resource.clone(),
                identity: op.identity(),
                kind: op.kind,
                status,
                attempts: own.iter().map(|s| s.attempts).sum(),
                provider_id: own
                    .iter()
                    .rev()
                    .find_map(|s| s.provider_id.clone())
                    .or_else(|| op.provider_id.clone()),
                error: own.iter().find_map(|s| s.error.clone()),
            }
        })
        .collect()
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::NotStarted => "not started",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptionParser;
    use crate::graph::{GraphBuilder, ResourceGraph};
    use crate::planner::DiffEngine;
    use crate::provider::{InjectedFailure, MockProvider, SandboxProvider};
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    const STACK: &str = r"
version: 1
stack:
  prefix: demo
resources:
  vpc:
    type: network
    properties: { cidr: CIDR }
  cluster:
    type: cluster
    properties: { network: { ref: vpc.id } }
  repo:
    type: repository
    properties: { repository_name: app }
";

    fn graph(cidr: &str) -> ResourceGraph {
        let yaml = STACK.replace("CIDR", cidr);
        let description = DescriptionParser::new().parse_yaml(&yaml, None).unwrap();
        GraphBuilder::new().build(&description).unwrap()
    }

    fn plan(graph: &ResourceGraph, state: &ProvisionedState) -> Plan {
        let diff = DiffEngine::new().compute_diff(graph, state);
        Plan::from_diff(&diff, graph, state, "hash").unwrap()
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        }
    }

    fn executor(provider: Arc<dyn Provider>, max_attempts: u32) -> PlanExecutor {
        PlanExecutor::new(provider, &ApplySettings::default()).with_policy(fast_policy(max_attempts))
    }

    fn store() -> (LocalStateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalStateStore::with_base_dir(dir.path()), dir)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(8), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_apply_resolves_references_and_persists() {
        let sandbox = Arc::new(SandboxProvider::new());
        let (store, _dir) = store();
        let graph = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(graph.stack());

        let report = executor(sandbox.clone(), 5)
            .execute(plan(&graph, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(state.len(), 3);

        let vpc_id = state.get("vpc").unwrap().provider_id.clone();
        let (_, cluster) = sandbox.find("cluster").await.unwrap();
        assert_eq!(cluster.properties["network"], serde_json::json!(vpc_id));

        let reloaded = store.load().await.unwrap().unwrap();
        assert_eq!(reloaded.resources, state.resources);
        assert!(plan(&graph, &reloaded).is_empty());
    }

    #[tokio::test]
    async fn test_replace_tears_down_dependents_first() {
        let sandbox = Arc::new(SandboxProvider::new());
        let (store, _dir) = store();
        let original = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(original.stack());
        let executor = executor(sandbox.clone(), 5);

        executor
            .execute(plan(&original, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();
        let old_vpc = state.get("vpc").unwrap().provider_id.clone();

        let changed = graph("10.1.0.0/16");
        let report = executor
            .execute(plan(&changed, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_success());

        let calls = sandbox.calls().await;
        let position = |call: &str| calls.iter().rposition(|c| c == call).unwrap();
        assert!(position("delete:cluster") < position("delete:vpc"));
        assert!(position("delete:vpc") < position("create:vpc"));
        assert!(position("create:vpc") < position("create:cluster"));
        assert!(!calls.iter().any(|c| c.ends_with(":repo") && !c.starts_with("create")));

        assert_ne!(state.get("vpc").unwrap().provider_id, old_vpc);
        assert!(plan(&changed, &state).is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sandbox = Arc::new(SandboxProvider::new());
        sandbox.inject_failure("vpc", InjectedFailure::Transient(2)).await;
        let (store, _dir) = store();
        let graph = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(graph.stack());

        let report = executor(sandbox.clone(), 5)
            .execute(plan(&graph, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.outcome("vpc").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_skip_dependents() {
        let sandbox = Arc::new(SandboxProvider::new());
        sandbox.inject_failure("vpc", InjectedFailure::Transient(10)).await;
        let (store, _dir) = store();
        let graph = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(graph.stack());

        let report = executor(sandbox.clone(), 3)
            .execute(plan(&graph, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();

        let vpc = report.outcome("vpc").unwrap();
        assert_eq!(vpc.status, OpStatus::Failed);
        assert_eq!(vpc.attempts, 3);
        assert_eq!(report.outcome("cluster").unwrap().status, OpStatus::Skipped);
        assert_eq!(report.outcome("repo").unwrap().status, OpStatus::Succeeded);
        assert_eq!(state.names(), vec!["repo"]);

        let Some(ApplyError::PartiallyApplied { failed, skipped, .. }) = report.partial_error() else {
            panic!("expected a partial apply");
        };
        assert_eq!(failed, vec!["network/vpc"]);
        assert_eq!(skipped, vec!["cluster/cluster"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let sandbox = Arc::new(SandboxProvider::new());
        sandbox.inject_failure("repo", InjectedFailure::Permanent).await;
        let (store, _dir) = store();
        let graph = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(graph.stack());

        let report = executor(sandbox.clone(), 5)
            .execute(plan(&graph, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();

        let repo = report.outcome("repo").unwrap();
        assert_eq!(repo.status, OpStatus::Failed);
        assert_eq!(repo.attempts, 1);
        assert!(repo.error.as_deref().unwrap().contains("permanent"));
        assert!(state.get("repo").is_none());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let sandbox = Arc::new(SandboxProvider::new());
        sandbox
            .inject_failure("repo", InjectedFailure::Stall(Duration::from_millis(500)))
            .await;
        let (store, _dir) = store();
        let graph = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(graph.stack());

        let policy = RetryPolicy {
            timeout: Duration::from_millis(20),
            ..fast_policy(1)
        };
        let report = PlanExecutor::new(sandbox.clone(), &ApplySettings::default())
            .with_policy(policy)
            .execute(plan(&graph, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();

        let repo = report.outcome("repo").unwrap();
        assert_eq!(repo.status, OpStatus::Failed);
        assert!(repo.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_changes_nothing() {
        let sandbox = Arc::new(SandboxProvider::new());
        let (store, _dir) = store();
        let graph = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(graph.stack());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor(sandbox.clone(), 5)
            .execute(plan(&graph, &state), &mut state, &store, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, StackError::Apply(ApplyError::Cancelled)));
        assert!(sandbox.calls().await.is_empty());
        assert_eq!(state.serial, 0);
        assert!(store.load().await.unwrap().is_none());
    }

    fn repositories(names: &[&str]) -> ResourceGraph {
        let mut yaml = String::from("version: 1\nstack: { prefix: demo }\nresources:\n");
        for name in names {
            yaml.push_str(&format!(
                "  {name}:\n    type: repository\n    properties: {{ repository_name: {name} }}\n"
            ));
        }
        let description = DescriptionParser::new().parse_yaml(&yaml, None).unwrap();
        GraphBuilder::new().build(&description).unwrap()
    }

    fn with_concurrency(provider: Arc<dyn Provider>, concurrency: usize) -> PlanExecutor {
        let settings = ApplySettings {
            concurrency,
            ..ApplySettings::default()
        };
        PlanExecutor::new(provider, &settings).with_policy(fast_policy(5))
    }

    #[tokio::test]
    async fn test_concurrency_bounds_in_flight_calls() {
        let graph = repositories(&["a", "b", "c", "d"]);

        for (concurrency, expected_peak) in [(1, 1), (2, 2), (4, 4), (8, 4)] {
            let sandbox = Arc::new(SandboxProvider::new().with_latency(Duration::from_millis(30)));
            let (store, _dir) = store();
            let mut state = ProvisionedState::new(graph.stack());

            let report = with_concurrency(sandbox.clone(), concurrency)
                .execute(plan(&graph, &state), &mut state, &store, &CancellationToken::new())
                .await
                .unwrap();

            assert!(report.is_success());
            assert_eq!(sandbox.peak_in_flight(), expected_peak, "concurrency {concurrency}");
            assert_eq!(state.resources.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_commits_in_flight_and_stops() {
        let sandbox = Arc::new(SandboxProvider::new().with_latency(Duration::from_millis(100)));
        let (store, _dir) = store();
        let graph = repositories(&["a", "b", "c", "d"]);
        let mut state = ProvisionedState::new(graph.stack());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = with_concurrency(sandbox.clone(), 1)
            .execute(plan(&graph, &state), &mut state, &store, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.succeeded(), vec!["repository/a"]);
        assert_eq!(report.not_started().len(), 3);
        assert!(report.failed().is_empty());
        assert!(report.skipped().is_empty());
        assert_eq!(sandbox.calls().await, vec!["create:a"]);

        assert_eq!(state.names(), vec!["a"]);
        let persisted = store.load().await.unwrap().unwrap();
        assert_eq!(persisted.names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_leaves_operation_not_started() {
        let sandbox = Arc::new(SandboxProvider::new());
        sandbox
            .inject_failure("vpc", InjectedFailure::Transient(3))
            .await;
        let (store, _dir) = store();
        let graph = graph("10.0.0.0/16");
        let mut state = ProvisionedState::new(graph.stack());

        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            ..fast_policy(5)
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = PlanExecutor::new(sandbox.clone(), &ApplySettings::default())
            .with_policy(policy)
            .execute(plan(&graph, &state), &mut state, &store, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        let vpc = report.outcome("vpc").unwrap();
        assert_eq!(vpc.status, OpStatus::NotStarted);
        assert_eq!(vpc.attempts, 1);
        assert_eq!(report.outcome("cluster").unwrap().status, OpStatus::NotStarted);
        assert_eq!(report.outcome("repo").unwrap().status, OpStatus::Succeeded);
        assert!(report.failed().is_empty());
        assert!(report.skipped().is_empty());
        assert!(state.get("vpc").is_none());
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let mut mock = MockProvider::new();
        mock.expect_delete()
            .times(1)
            .returning(|provider_id, _| {
                Err(StackError::Provider(ProviderError::NotFound {
                    provider_id: provider_id.to_string(),
                }))
            });

        let (store, _dir) = store();
        let mut state = ProvisionedState::new("demo-dev");
        state.apply_change(&StateChange::Upsert {
            record: ResourceRecord::new("repo", crate::config::ResourceType::Repository, "repo-1", "h"),
        });

        let destroy = Plan::destroy(&state, "hash").unwrap();
        let report = executor(Arc::new(mock), 5)
            .execute(destroy, &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_retries_reuse_the_idempotency_token() {
        let tokens = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&tokens);

        let mut mock = MockProvider::new();
        mock.expect_create().times(2).returning(move |resource, token| {
            let mut seen = seen.lock().unwrap();
            seen.push(token.to_string());
            if seen.len() == 1 {
                Err(StackError::Provider(ProviderError::transient(
                    resource.name.clone(),
                    "create",
                    "throttled",
                )))
            } else {
                Ok(ProvisionedResource::new("repo-1"))
            }
        });

        let yaml = r"
version: 1
stack: { prefix: demo }
resources:
  repo:
    type: repository
    properties: { repository_name: app }
";
        let description = DescriptionParser::new().parse_yaml(yaml, None).unwrap();
        let graph = GraphBuilder::new().build(&description).unwrap();
        let (store, _dir) = store();
        let mut state = ProvisionedState::new(graph.stack());

        let report = executor(Arc::new(mock), 5)
            .execute(plan(&graph, &state), &mut state, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_success());
        let tokens = tokens.lock().unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0], tokens[1]);
        assert_eq!(state.get("repo").unwrap().provider_id, "repo-1");
    }
}
