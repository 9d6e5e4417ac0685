//! Diff engine for comparing desired specs against provisioned state.
//!
//! Spec hashes are compared first; only on a mismatch are the changed
//! property names computed and classified against the replacement table of
//! the resource type.

use std::collections::BTreeSet;
use tracing::debug;

use crate::config::ResourceType;
use crate::graph::{ResourceGraph, ResourceSpec};
use crate::state::{ProvisionedState, ResourceRecord};

/// Pseudo-field reported when the dependency set changed.
pub const DEPENDS_ON_FIELD: &str = "depends_on";

/// Pseudo-field reported when the resource type changed.
pub const TYPE_FIELD: &str = "type";

/// Pseudo-field reported when the stack tags changed.
pub const STACK_TAGS_FIELD: &str = "stack.tags";

/// Engine for computing diffs between desired and provisioned states.
#[derive(Debug, Default)]
pub struct DiffEngine;

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource name.
    pub name: String,
    /// Resource type (desired type, or recorded type for deletes).
    pub resource_type: ResourceType,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Changed fields.
    pub details: Vec<DiffDetail>,
    /// Previous hash (if applicable).
    pub old_hash: Option<String>,
    /// New hash (if applicable).
    pub new_hash: Option<String>,
    /// Provider id of the existing resource (if any).
    pub provider_id: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be deleted and created again.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Old value.
    pub old_value: Option<serde_json::Value>,
    /// New value.
    pub new_value: Option<serde_json::Value>,
    /// Whether this change alone forces a replacement.
    pub forces_replacement: bool,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// Diffs for declared resources in dependency order, then deletes.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the diff between the desired graph and provisioned state.
    #[must_use]
    pub fn compute_diff(&self, graph: &ResourceGraph, state: &ProvisionedState) -> DiffResult {
        let mut diffs: Vec<ResourceDiff> = graph
            .in_order()
            .map(|spec| Self::compute_resource_diff(spec, state.get(spec.name())))
            .collect();

        for record in state.resources.values() {
            if !graph.contains(&record.name) {
                debug!("Resource {} is no longer declared", record.name);
                diffs.push(ResourceDiff {
                    name: record.name.clone(),
                    resource_type: record.resource_type,
                    diff_type: DiffType::Delete,
                    details: Vec::new(),
                    old_hash: Some(record.spec_hash.clone()),
                    new_hash: None,
                    provider_id: Some(record.provider_id.clone()),
                });
            }
        }

        DiffResult::from_diffs(diffs)
    }

    /// Computes the diff for a single resource.
    fn compute_resource_diff(spec: &ResourceSpec, record: Option<&ResourceRecord>) -> ResourceDiff {
        let mut diff = ResourceDiff {
            name: spec.id.name.clone(),
            resource_type: spec.resource_type(),
            diff_type: DiffType::Create,
            details: Vec::new(),
            old_hash: record.map(|r| r.spec_hash.clone()),
            new_hash: Some(spec.spec_hash.clone()),
            provider_id: record.map(|r| r.provider_id.clone()),
        };

        let Some(record) = record else {
            debug!("Resource {} needs to be created", spec.name());
            return diff;
        };

        if record.resource_type != spec.resource_type() {
            diff.diff_type = DiffType::Replace;
            diff.details.push(DiffDetail {
                field: String::from(TYPE_FIELD),
                old_value: Some(serde_json::Value::String(record.resource_type.to_string())),
                new_value: Some(serde_json::Value::String(spec.resource_type().to_string())),
                forces_replacement: true,
            });
            return diff;
        }

        if record.spec_hash == spec.spec_hash {
            diff.diff_type = DiffType::NoChange;
            return diff;
        }

        diff.details = Self::compute_detailed_diff(spec, record);
        diff.diff_type = if diff.details.iter().any(|d| d.forces_replacement) {
            DiffType::Replace
        } else {
            DiffType::Update
        };

        debug!(
            "Resource {} needs {} ({} fields changed)",
            spec.name(),
            diff.diff_type,
            diff.details.len()
        );
        diff
    }

    /// Lists changed properties between the spec and its record.
    fn compute_detailed_diff(spec: &ResourceSpec, record: &ResourceRecord) -> Vec<DiffDetail> {
        let resource_type = spec.resource_type();
        let keys: BTreeSet<&String> = spec.properties.keys().chain(record.properties.keys()).collect();

        let mut details: Vec<DiffDetail> = keys
            .into_iter()
            .filter_map(|key| {
                let new_value = spec.properties.get(key).map(crate::config::PropertyValue::to_canonical);
                let old_value = record.properties.get(key).cloned();
                (new_value != old_value).then(|| DiffDetail {
                    field: key.clone(),
                    forces_replacement: resource_type.replaces_on(key),
                    old_value,
                    new_value,
                })
            })
            .collect();

        if spec.dependencies != record.dependencies {
            let as_json = |deps: &BTreeSet<String>| {
                serde_json::Value::Array(
                    deps.iter()
                        .map(|d| serde_json::Value::String(d.clone()))
                        .collect(),
                )
            };
            details.push(DiffDetail {
                field: String::from(DEPENDS_ON_FIELD),
                old_value: Some(as_json(&record.dependencies)),
                new_value: Some(as_json(&spec.dependencies)),
                forces_replacement: false,
            });
        }

        if spec.tags != record.tags {
            let as_json = |tags: &std::collections::BTreeMap<String, String>| {
                serde_json::Value::Object(
                    tags.iter()
                        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                        .collect(),
                )
            };
            details.push(DiffDetail {
                field: String::from(STACK_TAGS_FIELD),
                old_value: Some(as_json(&record.tags)),
                new_value: Some(as_json(&spec.tags)),
                forces_replacement: false,
            });
        }

        details
    }
}

impl DiffResult {
    fn from_diffs(diffs: Vec<ResourceDiff>) -> Self {
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();

        Self {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Looks up the diff for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name)
    }
}

impl ResourceDiff {
    /// Returns the names of the changed fields.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<String> {
        self.details.iter().map(|d| d.field.clone()).collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if !self.details.is_empty() {
            write!(f, " ({})", self.changed_fields().join(", "))?;
        }
        Ok(())
    }
}
