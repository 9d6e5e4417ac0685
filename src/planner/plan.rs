//! Provisioning plan generation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::config::ResourceType;
use crate::error::{PlanError, Result, StackError};
use crate::graph::{ResourceGraph, ResourceSpec};
use crate::state::ProvisionedState;

use super::diff::{DiffResult, DiffType, ResourceDiff};

/// A complete, ordered provisioning plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Qualified stack name.
    pub stack: String,
    /// Stack-wide tags forwarded to every resource.
    pub tags: BTreeMap<String, String>,
    /// Hash of the description the plan was computed from.
    pub description_hash: String,
    /// State serial the plan was computed against.
    pub state_serial: u64,
    /// Operations: deletes first, then the declared resources in dependency order.
    pub ops: Vec<PlanOp>,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct PlanOp {
    /// Resource name.
    pub resource: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// What to do.
    pub kind: OpKind,
    /// Human readable cause.
    pub reason: String,
    /// Properties that changed.
    pub changed_fields: Vec<String>,
    /// Provider id of the existing resource.
    pub provider_id: Option<String>,
    /// Recorded spec hash of the existing resource.
    pub old_hash: Option<String>,
    /// Desired spec hash.
    pub new_hash: Option<String>,
    /// Resources this operation waits for: desired dependencies for
    /// creates and updates, recorded dependencies for deletes.
    pub dependencies: BTreeSet<String>,
    /// Desired spec, absent for deletes.
    #[serde(skip)]
    pub spec: Option<ResourceSpec>,
}

/// Kind of planned operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete the resource and create it again.
    Replace,
    /// Delete the resource.
    Delete,
    /// Nothing to do.
    NoOp,
}

impl Plan {
    /// Builds a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns `PlanConflict` if two operations target the same provider id.
    pub fn from_diff(
        diff: &DiffResult,
        graph: &ResourceGraph,
        state: &ProvisionedState,
        description_hash: &str,
    ) -> Result<Self> {
        let mut ops = Self::delete_ops(
            diff.diffs
                .iter()
                .filter(|d| d.diff_type == DiffType::Delete)
                .map(|d| d.name.as_str()),
            state,
            "no longer declared",
        );

        let cascaded = Self::cascade_replacements(diff, graph);

        for spec in graph.in_order() {
            let Some(resource_diff) = diff.get(spec.name()) else {
                continue;
            };
            ops.push(Self::graph_op(spec, resource_diff, cascaded.get(spec.name())));
        }

        let plan = Self {
            created_at: Utc::now(),
            stack: graph.stack().to_string(),
            tags: graph.tags().clone(),
            description_hash: description_hash.to_string(),
            state_serial: state.serial,
            ops,
        };
        plan.check_conflicts()?;

        debug!(
            "Plan for {}: {} operations ({} actionable)",
            plan.stack,
            plan.ops.len(),
            plan.actionable().count()
        );
        Ok(plan)
    }

    /// Builds a plan deleting every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns `PlanConflict` if two records share a provider id.
    pub fn destroy(state: &ProvisionedState, description_hash: &str) -> Result<Self> {
        let plan = Self {
            created_at: Utc::now(),
            stack: state.stack.clone(),
            tags: BTreeMap::new(),
            description_hash: description_hash.to_string(),
            state_serial: state.serial,
            ops: Self::delete_ops(state.resources.keys().map(String::as_str), state, "destroy"),
        };
        plan.check_conflicts()?;
        Ok(plan)
    }

    /// Maps each resource replaced only because of an ancestor to that
    /// ancestor's name.
    fn cascade_replacements(diff: &DiffResult, graph: &ResourceGraph) -> HashMap<String, String> {
        let mut cascaded = HashMap::new();

        for spec in graph.in_order() {
            let replaced = diff
                .get(spec.name())
                .is_some_and(|d| d.diff_type == DiffType::Replace);
            if !replaced || cascaded.contains_key(spec.name()) {
                continue;
            }

            for descendant in graph.descendants(spec.name()) {
                let existing = diff.get(&descendant).is_some_and(|d| {
                    matches!(d.diff_type, DiffType::Update | DiffType::NoChange)
                });
                if existing {
                    cascaded
                        .entry(descendant)
                        .or_insert_with(|| spec.name().to_string());
                }
            }
        }

        cascaded
    }

    fn graph_op(spec: &ResourceSpec, diff: &ResourceDiff, cascaded_from: Option<&String>) -> PlanOp {
        let (kind, reason) = match (diff.diff_type, cascaded_from) {
            (_, Some(ancestor)) => (OpKind::Replace, format!("dependency '{ancestor}' is replaced")),
            (DiffType::Create, None) => (OpKind::Create, String::from("not provisioned")),
            (DiffType::Update, None) => (
                OpKind::Update,
                format!("changed: {}", diff.changed_fields().join(", ")),
            ),
            (DiffType::Replace, None) => {
                let forcing: Vec<&str> = diff
                    .details
                    .iter()
                    .filter(|d| d.forces_replacement)
                    .map(|d| d.field.as_str())
                    .collect();
                (OpKind::Replace, format!("forces replacement: {}", forcing.join(", ")))
            }
            (DiffType::NoChange | DiffType::Delete, None) => (OpKind::NoOp, String::from("up to date")),
        };

        PlanOp {
            resource: spec.name().to_string(),
            resource_type: spec.resource_type(),
            kind,
            reason,
            changed_fields: diff.changed_fields(),
            provider_id: diff.provider_id.clone(),
            old_hash: diff.old_hash.clone(),
            new_hash: Some(spec.spec_hash.clone()),
            dependencies: spec.dependencies.clone(),
            spec: Some(spec.clone()),
        }
    }

    /// Orders deletes so that every resource comes before the resources it
    /// depended on. Ties are broken by name.
    fn delete_ops<'a>(
        names: impl Iterator<Item = &'a str>,
        state: &ProvisionedState,
        reason: &str,
    ) -> Vec<PlanOp> {
        let doomed: BTreeSet<&str> = names.collect();

        // Kahn over the recorded dependents: a resource is ready once every
        // doomed resource depending on it is ordered.
        let mut pending: BTreeMap<&str, usize> = doomed
            .iter()
            .map(|&name| {
                let blockers = state
                    .dependents_of(name)
                    .into_iter()
                    .filter(|d| doomed.contains(d))
                    .count();
                (name, blockers)
            })
            .collect();

        let mut order = Vec::with_capacity(doomed.len());
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .find(|(_, blockers)| **blockers == 0)
                .map(|(&name, _)| name);

            // A cycle in recorded dependencies: fall back to name order.
            let Some(name) = ready.or_else(|| pending.keys().next().copied()) else {
                break;
            };
            pending.remove(name);
            order.push(name);

            if let Some(record) = state.get(name) {
                for dependency in &record.dependencies {
                    if let Some(blockers) = pending.get_mut(dependency.as_str()) {
                        *blockers = blockers.saturating_sub(1);
                    }
                }
            }
        }

        order
            .into_iter()
            .filter_map(|name| state.get(name))
            .map(|record| PlanOp {
                resource: record.name.clone(),
                resource_type: record.resource_type,
                kind: OpKind::Delete,
                reason: reason.to_string(),
                changed_fields: Vec::new(),
                provider_id: Some(record.provider_id.clone()),
                old_hash: Some(record.spec_hash.clone()),
                new_hash: None,
                dependencies: record.dependencies.clone(),
                spec: None,
            })
            .collect()
    }

    fn check_conflicts(&self) -> Result<()> {
        let mut seen: HashMap<&str, &str> = HashMap::new();

        for op in &self.ops {
            if !matches!(op.kind, OpKind::Update | OpKind::Replace | OpKind::Delete) {
                continue;
            }
            let Some(provider_id) = op.provider_id.as_deref() else {
                continue;
            };
            if let Some(first) = seen.insert(provider_id, &op.resource) {
                return Err(StackError::Plan(PlanError::PlanConflict {
                    provider_id: provider_id.to_string(),
                    first: first.to_string(),
                    second: op.resource.clone(),
                }));
            }
        }

        Ok(())
    }

    /// Iterates operations that change something.
    pub fn actionable(&self) -> impl Iterator<Item = &PlanOp> {
        self.ops.iter().filter(|op| op.kind != OpKind::NoOp)
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actionable().next().is_none()
    }

    /// Counts operations of one kind.
    #[must_use]
    pub fn count(&self, kind: OpKind) -> usize {
        self.ops.iter().filter(|op| op.kind == kind).count()
    }

    /// Looks up the operation for a resource.
    #[must_use]
    pub fn op(&self, resource: &str) -> Option<&PlanOp> {
        self.ops.iter().find(|op| op.resource == resource)
    }

    /// Returns a one-line summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.count(OpKind::Create),
            self.count(OpKind::Update),
            self.count(OpKind::Replace),
            self.count(OpKind::Delete),
            self.count(OpKind::NoOp)
        )
    }
}

impl PlanOp {
    /// Returns the `<type>/<name>` identity.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource)
    }
}

impl OpKind {
    /// Returns the plan symbol for this kind.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlanOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.kind.symbol(), self.kind, self.identity())?;
        if self.kind != OpKind::NoOp {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Plan for stack '{}':", self.stack)?;
        if self.is_empty() {
            writeln!(f, "  No changes. Infrastructure is up to date.")?;
        } else {
            for op in self.actionable() {
                writeln!(f, "  {op}")?;
            }
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptionParser;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;
    use crate::state::{ResourceRecord, StateChange};

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

    fn provisioned(graph: &ResourceGraph) -> ProvisionedState {
        let mut state = ProvisionedState::new(graph.stack());
        for spec in graph.resources() {
            let mut record = ResourceRecord::new(
                spec.name(),
                spec.resource_type(),
                &format!("id-{}", spec.name()),
                &spec.spec_hash,
            );
            record.properties = spec
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_canonical()))
                .collect();
            record.dependencies = spec.dependencies.clone();
            state.apply_change(&StateChange::Upsert { record });
        }
        state
    }

    fn plan(graph: &ResourceGraph, state: &ProvisionedState) -> Result<Plan> {
        let diff = DiffEngine::new().compute_diff(graph, state);
        Plan::from_diff(&diff, graph, state, "hash")
    }

    fn kinds(plan: &Plan) -> Vec<(String, OpKind)> {
        plan.ops.iter().map(|op| (op.resource.clone(), op.kind)).collect()
    }

    #[test]
    fn test_first_plan_creates_in_order() {
        let graph = graph("10.0.0.0/16");
        let plan = plan(&graph, &ProvisionedState::new("demo-dev")).unwrap();

        assert_eq!(
            kinds(&plan),
            vec![
                (String::from("vpc"), OpKind::Create),
                (String::from("cluster"), OpKind::Create),
                (String::from("repo"), OpKind::Create),
            ]
        );
        assert_eq!(plan.state_serial, 0);
    }

    #[test]
    fn test_converged_plan_is_empty() {
        let graph = graph("10.0.0.0/16");
        let state = provisioned(&graph);
        let plan = plan(&graph, &state).unwrap();

        assert!(plan.is_empty());
        assert_eq!(plan.count(OpKind::NoOp), 3);
    }

    #[test]
    fn test_replacement_cascades_to_dependents() {
        let state = provisioned(&graph("10.0.0.0/16"));
        let plan = plan(&graph("10.1.0.0/16"), &state).unwrap();

        assert_eq!(plan.op("vpc").unwrap().kind, OpKind::Replace);
        let cluster = plan.op("cluster").unwrap();
        assert_eq!(cluster.kind, OpKind::Replace);
        assert!(cluster.reason.contains("vpc"));
        assert_eq!(plan.op("repo").unwrap().kind, OpKind::NoOp);
    }

    #[test]
    fn test_deletes_come_first_dependents_before_dependencies() {
        let mut state = provisioned(&graph("10.0.0.0/16"));
        let old_vpc = ResourceRecord::new("old-vpc", ResourceType::Network, "net-9", "a");
        let mut old_cluster = ResourceRecord::new("old-cluster", ResourceType::Cluster, "cl-9", "b");
        old_cluster.dependencies.insert(String::from("old-vpc"));
        state.apply_change(&StateChange::Upsert { record: old_vpc });
        state.apply_change(&StateChange::Upsert { record: old_cluster });

        let plan = plan(&graph("10.0.0.0/16"), &state).unwrap();

        assert_eq!(plan.ops[0].resource, "old-cluster");
        assert_eq!(plan.ops[0].kind, OpKind::Delete);
        assert_eq!(plan.ops[1].resource, "old-vpc");
        assert_eq!(plan.count(OpKind::Delete), 2);
    }

    #[test]
    fn test_shared_provider_id_is_a_conflict() {
        let mut state = provisioned(&graph("10.0.0.0/16"));
        let stray = ResourceRecord::new("stray", ResourceType::Repository, "id-repo", "c");
        state.apply_change(&StateChange::Upsert { record: stray });

        // "stray" is deleted while "repo" is a no-op: only one op touches the id.
        assert!(plan(&graph("10.1.0.0/16"), &state).is_ok());

        let mut state = provisioned(&graph("10.0.0.0/16"));
        let twin = ResourceRecord::new("twin", ResourceType::Network, "id-vpc", "c");
        state.apply_change(&StateChange::Upsert { record: twin });

        let err = plan(&graph("10.1.0.0/16"), &state).unwrap_err();
        assert!(matches!(
            err,
            StackError::Plan(PlanError::PlanConflict { ref provider_id, .. }) if provider_id == "id-vpc"
        ));
    }

    #[test]
    fn test_destroy_plan_orders_all_records() {
        let state = provisioned(&graph("10.0.0.0/16"));
        let plan = Plan::destroy(&state, "hash").unwrap();

        let order: Vec<&str> = plan.ops.iter().map(|op| op.resource.as_str()).collect();
        let cluster = order.iter().position(|n| *n == "cluster").unwrap();
        let vpc = order.iter().position(|n| *n == "vpc").unwrap();
        assert!(cluster < vpc);
        assert!(plan.ops.iter().all(|op| op.kind == OpKind::Delete));
    }

    #[test]
    fn test_display_lists_actionable_ops() {
        let plan = plan(&graph("10.0.0.0/16"), &ProvisionedState::new("demo-dev")).unwrap();
        let text = plan.to_string();

        assert!(text.contains("+ create network/vpc"));
        assert!(text.contains("3 to create"));
    }
}
