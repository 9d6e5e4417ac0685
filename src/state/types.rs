//! State types for tracking provisioned resources.
//!
//! These types represent the recorded outcome of previous applies. They are
//! the "current" side of every plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ResourceType;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept in state.
pub const MAX_HISTORY: usize = 100;

/// The complete provisioned state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisionedState {
    /// State format version.
    pub version: String,
    /// Qualified stack name.
    pub stack: String,
    /// Monotonic counter bumped by every committed change.
    #[serde(default)]
    pub serial: u64,
    /// Hash of the last applied description.
    #[serde(default)]
    pub description_hash: String,
    /// Provisioned resources by name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// Record of a single provisioned resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Spec hash when last applied.
    pub spec_hash: String,
    /// Last applied properties in canonical form (references unresolved).
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Output attributes reported by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Names of the resources this one depended on when applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Stack tags stamped on the resource when applied.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single committed change to the state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum StateChange {
    /// Insert or replace a record.
    Upsert {
        /// The new record.
        record: ResourceRecord,
    },
    /// Remove a record.
    Remove {
        /// Name of the removed resource.
        name: String,
    },
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: ApplyOperation,
    /// Description hash at the time of the run.
    pub description_hash: String,
    /// Operations that succeeded.
    #[serde(default)]
    pub succeeded: Vec<String>,
    /// Operations that failed.
    #[serde(default)]
    pub failed: Vec<String>,
    /// Operations skipped because a dependency failed.
    #[serde(default)]
    pub skipped: Vec<String>,
    /// Operations never started.
    #[serde(default)]
    pub not_started: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// Convergence to the description.
    Apply,
    /// Removal of every resource.
    Destroy,
}

impl ProvisionedState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(stack: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            serial: 0,
            description_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource record by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Returns the number of recorded resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns all recorded resource names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Applies a change and bumps the serial.
    pub fn apply_change(&mut self, change: &StateChange) {
        match change {
            StateChange::Upsert { record } => {
                self.resources.insert(record.name.clone(), record.clone());
            }
            StateChange::Remove { name } => {
                self.resources.remove(name);
            }
        }
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Returns names of recorded resources whose recorded dependencies
    /// include `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.resources
            .values()
            .filter(|r| r.dependencies.contains(name))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }
}

impl ResourceRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(
        name: &str,
        resource_type: ResourceType,
        provider_id: &str,
        spec_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            resource_type,
            provider_id: provider_id.to_string(),
            spec_hash: spec_hash.to_string(),
            properties: BTreeMap::new(),
            outputs: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            tags: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns an output attribute.
    ///
    /// `id` falls back to the provider id when the provider did not report it.
    #[must_use]
    pub fn output(&self, attribute: &str) -> Option<serde_json::Value> {
        self.outputs.get(attribute).cloned().or_else(|| {
            (attribute == "id").then(|| serde_json::Value::String(self.provider_id.clone()))
        })
    }
}

impl StateChange {
    /// Returns the name of the resource the change touches.
    #[must_use]
    pub fn resource_name(&self) -> &str {
        match self {
            Self::Upsert { record } => &record.name,
            Self::Remove { name } => name,
        }
    }
}

impl ApplyHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: ApplyOperation, description_hash: &str, succeeded: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            description_hash: description_hash.to_string(),
            succeeded,
            failed: Vec::new(),
            skipped: Vec::new(),
            not_started: Vec::new(),
            success: true,
            error: None,
        }
    }

    /// Marks the entry as failed.
    #[must_use]
    pub fn with_failure(mut self, error: &str) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_change_bumps_serial() {
        let mut state = ProvisionedState::new("demo-dev");
        let record = ResourceRecord::new("vpc", ResourceType::Network, "net-1", "abc");

        state.apply_change(&StateChange::Upsert { record });
        assert_eq!(state.serial, 1);
        assert_eq!(state.get("vpc").unwrap().provider_id, "net-1");

        state.apply_change(&StateChange::Remove {
            name: String::from("vpc"),
        });
        assert_eq!(state.serial, 2);
        assert!(state.is_empty());
    }

    #[test]
    fn test_output_falls_back_to_provider_id() {
        let record = ResourceRecord::new("vpc", ResourceType::Network, "net-1", "abc");
        assert_eq!(record.output("id"), Some(serde_json::json!("net-1")));
        assert_eq!(record.output("cidr"), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = ProvisionedState::new("demo-dev");
        for _ in 0..(MAX_HISTORY + 5) {
            state.add_history(ApplyHistoryEntry::new(ApplyOperation::Apply, "h", vec![]));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_state_change_json_shape() {
        let change = StateChange::Remove {
            name: String::from("vpc"),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json, serde_json::json!({ "change": "remove", "name": "vpc" }));
    }

    #[test]
    fn test_dependents_of() {
        let mut state = ProvisionedState::new("demo-dev");
        let vpc = ResourceRecord::new("vpc", ResourceType::Network, "net-1", "a");
        let mut cluster = ResourceRecord::new("cluster", ResourceType::Cluster, "cl-1", "b");
        cluster.dependencies.insert(String::from("vpc"));

        state.apply_change(&StateChange::Upsert { record: vpc });
        state.apply_change(&StateChange::Upsert { record: cluster });

        assert_eq!(state.dependents_of("vpc"), vec!["cluster"]);
        assert!(state.dependents_of("cluster").is_empty());
    }
}
