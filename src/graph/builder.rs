//! Resource graph construction.
//!
//! Turns the declarations of a stack description into a validated
//! [`ResourceGraph`]: every reference resolves to a declared resource that
//! exports the referenced attribute, and the graph is acyclic.

use std::collections::{BTreeSet, HashSet};
use tracing::{debug, instrument};

use crate::config::{SpecHasher, StackDescription};
use crate::error::{GraphError, Result, StackError};

use super::resolver::DependencyResolver;
use super::types::{ResourceGraph, ResourceId, ResourceSpec};

/// Builds resource graphs from stack descriptions.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    hasher: SpecHasher,
    resolver: DependencyResolver,
}

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: SpecHasher::new(),
            resolver: DependencyResolver::new(),
        }
    }

    /// Builds the resource graph for a description.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource`, `UnknownReference` or `CyclicDependency`.
    #[instrument(skip_all, fields(stack = %description.qualified_name()))]
    pub fn build(&self, description: &StackDescription) -> Result<ResourceGraph> {
        let declared: HashSet<&str> = description.resource_names().into_iter().collect();
        if declared.len() != description.resources.len() {
            let mut seen = HashSet::new();
            for resource in &description.resources {
                if !seen.insert(resource.name.as_str()) {
                    return Err(StackError::Graph(GraphError::DuplicateResource {
                        name: resource.name.clone(),
                    }));
                }
            }
        }

        let mut specs = Vec::with_capacity(description.resources.len());

        for (declaration_index, decl) in description.resources.iter().enumerate() {
            let mut dependencies = BTreeSet::new();

            for reference in decl.references() {
                let Some(target) = description.resource(&reference.resource) else {
                    return Err(StackError::Graph(GraphError::UnknownReference {
                        resource: decl.name.clone(),
                        reference: reference.to_string(),
                    }));
                };

                if !target.resource_type.exports_attribute(&reference.attribute) {
                    return Err(StackError::Graph(GraphError::UnknownReference {
                        resource: decl.name.clone(),
                        reference: format!(
                            "{reference} ({} exports: {})",
                            target.resource_type,
                            target.resource_type.exports().join(", ")
                        ),
                    }));
                }

                dependencies.insert(reference.resource.clone());
            }

            for dependency in &decl.depends_on {
                if !declared.contains(dependency.as_str()) {
                    return Err(StackError::Graph(GraphError::UnknownReference {
                        resource: decl.name.clone(),
                        reference: dependency.clone(),
                    }));
                }
                dependencies.insert(dependency.clone());
            }

            if dependencies.contains(&decl.name) {
                return Err(StackError::Graph(GraphError::CyclicDependency {
                    resources: vec![decl.name.clone()],
                }));
            }

            let spec_hash = self.hasher.hash_resource(
                decl.resource_type,
                &decl.properties,
                &dependencies,
                &description.stack.tags,
            );

            debug!(
                resource = %decl.name,
                dependencies = dependencies.len(),
                "Built resource spec"
            );

            specs.push(ResourceSpec {
                id: ResourceId::new(decl.name.clone(), decl.resource_type),
                properties: decl.properties.clone(),
                dependencies,
                declaration_index,
                tags: description.stack.tags.clone(),
                spec_hash,
            });
        }

        let order = self.resolver.resolve(&specs)?;

        Ok(ResourceGraph::from_parts(
            description.qualified_name(),
            description.stack.tags.clone(),
            specs,
            order,
        ))
    }
}
