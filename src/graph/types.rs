//! Resource graph types.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use crate::config::{PropertyValue, Reference, ResourceType};

/// Identity of a resource: its unique name and its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceId {
    /// Unique resource name within the stack.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
}

/// A fully built resource specification.
///
/// Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSpec {
    /// Resource identity.
    pub id: ResourceId,
    /// Property bag, references unresolved.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Names of every resource this one depends on.
    pub dependencies: BTreeSet<String>,
    /// Position in the description.
    pub declaration_index: usize,
    /// Stack tags stamped on the resource.
    pub tags: BTreeMap<String, String>,
    /// Hash of type, properties, dependencies and tags.
    pub spec_hash: String,
}

/// Directed acyclic graph of resource specifications.
///
/// Edges point from a dependent to its dependencies. The topological order
/// is computed once at build time.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Qualified stack name.
    stack: String,
    /// Tags applied to every resource.
    tags: BTreeMap<String, String>,
    /// Specs in declaration order.
    resources: Vec<ResourceSpec>,
    /// Name to declaration index.
    index: HashMap<String, usize>,
    /// Per node, the indices of its direct dependents.
    dependents: Vec<Vec<usize>>,
    /// Topological order as declaration indices.
    order: Vec<usize>,
}

impl ResourceId {
    /// Creates a new identity.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            name: name.into(),
            resource_type,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.name)
    }
}

impl ResourceSpec {
    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Returns the resource type.
    #[must_use]
    pub const fn resource_type(&self) -> ResourceType {
        self.id.resource_type
    }

    /// Returns every reference in the property bag.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for value in self.properties.values() {
            collect(value, &mut refs);
        }
        refs
    }

    /// Returns the canonical JSON form of the property bag.
    #[must_use]
    pub fn canonical_properties(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_canonical()))
                .collect(),
        )
    }
}

fn collect<'a>(value: &'a PropertyValue, out: &mut Vec<&'a Reference>) {
    match value {
        PropertyValue::Reference(r) => out.push(r),
        PropertyValue::List(items) => items.iter().for_each(|item| collect(item, out)),
        PropertyValue::Map(entries) => entries.values().for_each(|item| collect(item, out)),
        PropertyValue::Literal(_) => {}
    }
}

impl ResourceGraph {
    pub(super) fn from_parts(
        stack: String,
        tags: BTreeMap<String, String>,
        resources: Vec<ResourceSpec>,
        order: Vec<usize>,
    ) -> Self {
        let index = build_index(&resources);
        let dependents = build_dependents(&resources, &index);
        Self {
            stack,
            tags,
            resources,
            index,
            dependents,
            order,
        }
    }

    /// Returns the qualified stack name.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Returns the stack-wide tags.
    #[must_use]
    pub const fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Looks up a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceSpec> {
        self.index.get(name).map(|&i| &self.resources[i])
    }

    /// Returns true if a resource with this name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Iterates resources in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.iter()
    }

    /// Iterates resources in dependency order: every resource comes after
    /// everything it depends on, ties broken by declaration order.
    pub fn in_order(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.order.iter().map(|&i| &self.resources[i])
    }

    /// Returns the names of the direct dependents of `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index.get(name).map_or_else(Vec::new, |&i| {
            self.dependents[i]
                .iter()
                .map(|&d| self.resources[d].name())
                .collect()
        })
    }

    /// Returns every transitive dependent of `name`.
    #[must_use]
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.index.get(name) else {
            return found;
        };

        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &dependent in &self.dependents[current] {
                if found.insert(self.resources[dependent].id.name.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        found
    }
}

pub(super) fn build_index(resources: &[ResourceSpec]) -> HashMap<String, usize> {
    resources
        .iter()
        .enumerate()
        .map(|(i, spec)| (spec.id.name.clone(), i))
        .collect()
}

pub(super) fn build_dependents(
    resources: &[ResourceSpec],
    index: &HashMap<String, usize>,
) -> Vec<Vec<usize>> {
    let mut dependents = vec![Vec::new(); resources.len()];
    for (i, spec) in resources.iter().enumerate() {
        for dependency in &spec.dependencies {
            if let Some(&d) = index.get(dependency) {
                dependents[d].push(i);
            }
        }
    }
    dependents
}
