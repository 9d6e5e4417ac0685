//! Provisioning collaborators.
//!
//! The engine never talks to a cloud directly. Every mutation goes through a
//! [`Provider`]: a local sandbox for development and tests, or a remote
//! provisioning API spoken over HTTP.

mod http;
mod sandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ResourceType;
use crate::error::Result;

pub use http::HttpProvider;
pub use sandbox::{InjectedFailure, SandboxProvider};

/// A resource with every reference replaced by a concrete value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    /// Qualified stack name.
    pub stack: String,
    /// Resource name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Resolved properties.
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Tags applied to the resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// What a provider reports after creating or updating a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    /// Identifier assigned by the provider.
    #[serde(rename = "id")]
    pub provider_id: String,
    /// Output attributes.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

/// Performs provisioning calls.
///
/// Every call carries an idempotency token. Repeating a call with the same
/// token must not create a second resource. Errors are reported as
/// `ProviderError::Transient`, `ProviderError::Permanent` or
/// `ProviderError::NotFound`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Creates a resource.
    async fn create(&self, resource: &ResolvedResource, token: &str)
    -> Result<ProvisionedResource>;

    /// Updates a resource in place.
    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        token: &str,
    ) -> Result<ProvisionedResource>;

    /// Deletes a resource.
    async fn delete(&self, provider_id: &str, token: &str) -> Result<()>;
}

impl ResolvedResource {
    /// Returns the `<type>/<name>` identity.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}/{}", self.resource_type, self.name)
    }

    /// Returns a string property.
    #[must_use]
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(serde_json::Value::as_str)
    }
}

impl ProvisionedResource {
    /// Creates a result with only the `id` output.
    #[must_use]
    pub fn new(provider_id: impl Into<String>) -> Self {
        let provider_id = provider_id.into();
        let outputs = BTreeMap::from([(
            String::from("id"),
            serde_json::Value::String(provider_id.clone()),
        )]);
        Self {
            provider_id,
            outputs,
        }
    }

    /// Adds an output attribute.
    #[must_use]
    pub fn with_output(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }
}
