//! Local sandbox provider.
//!
//! Records resources in memory, optionally mirrored to a JSON inventory file,
//! and fabricates plausible outputs per resource type. Failures can be
//! injected per resource name to exercise retries and partial applies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ResourceType;
use crate::error::{ProviderError, Result, StackError, StateError};

use super::{ProvisionedResource, Provider, ResolvedResource};

/// A failure to return instead of performing a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Fail the next `n` calls with a transient error, then succeed.
    Transient(u32),
    /// Fail every call with a permanent error.
    Permanent,
    /// Hang for the given duration before answering.
    Stall(Duration),
}

/// What the sandbox remembers about one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxResource {
    /// Resource name.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Last applied properties.
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Reported outputs.
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Stack tags stamped on the resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Releases an in-flight slot when the call finishes or is dropped.
struct InFlightSlot<'a>(&'a AtomicUsize);

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    next_id: u64,
    resources: BTreeMap<String, SandboxResource>,
    /// Idempotency token to provider id.
    tokens: BTreeMap<String, String>,
}

/// In-process provider for development and tests.
#[derive(Debug, Default)]
pub struct SandboxProvider {
    inventory: Mutex<Inventory>,
    path: Option<PathBuf>,
    failures: Mutex<HashMap<String, InjectedFailure>>,
    calls: Mutex<Vec<String>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SandboxProvider {
    /// Creates an empty in-memory sandbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a sandbox mirrored to `path`, loading it if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the inventory file exists but cannot be read.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let inventory = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content).map_err(|e| {
                StackError::State(StateError::corrupted(format!(
                    "Sandbox inventory {} is unreadable: {e}",
                    path.display()
                )))
            })?
        } else {
            Inventory::default()
        };

        info!("Sandbox inventory: {}", path.display());

        Ok(Self {
            inventory: Mutex::new(inventory),
            path: Some(path),
            ..Self::default()
        })
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes calls for resource `name` fail.
    pub async fn inject_failure(&self, name: &str, failure: InjectedFailure) {
        self.failures.lock().await.insert(name.to_string(), failure);
    }

    /// Removes any failure injected for `name`.
    pub async fn clear_failure(&self, name: &str) {
        self.failures.lock().await.remove(name);
    }

    /// Returns the largest number of calls observed in flight at once.
    ///
    /// Only calls delayed by [`Self::with_latency`] are counted.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Returns the calls made so far as `<operation>:<name>`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Returns a snapshot of the live resources keyed by provider id.
    pub async fn resources(&self) -> BTreeMap<String, SandboxResource> {
        self.inventory.lock().await.resources.clone()
    }

    /// Returns the live resource with this name, if any.
    pub async fn find(&self, name: &str) -> Option<(String, SandboxResource)> {
        self.inventory
            .lock()
            .await
            .resources
            .iter()
            .find(|(_, r)| r.name == name)
            .map(|(id, r)| (id.clone(), r.clone()))
    }

    async fn before_call(&self, operation: &str, name: &str) -> Result<()> {
        self.calls.lock().await.push(format!("{operation}:{name}"));

        if let Some(latency) = self.latency {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let _slot = InFlightSlot(&self.in_flight);
            tokio::time::sleep(latency).await;
        }

        let failure = {
            let mut failures = self.failures.lock().await;
            match failures.get_mut(name) {
                Some(InjectedFailure::Transient(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(InjectedFailure::Transient(*remaining))
                }
                Some(InjectedFailure::Transient(_)) | None => None,
                Some(other) => Some(*other),
            }
        };

        match failure {
            Some(InjectedFailure::Transient(_)) => Err(StackError::Provider(
                ProviderError::transient(name, operation, "sandbox: injected transient failure"),
            )),
            Some(InjectedFailure::Permanent) => Err(StackError::Provider(
                ProviderError::permanent(name, operation, "sandbox: injected permanent failure"),
            )),
            Some(InjectedFailure::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn persist(&self, inventory: &Inventory) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(inventory).map_err(|e| {
            StackError::State(StateError::serialization(format!(
                "Failed to serialize sandbox inventory: {e}"
            )))
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = path.with_extension("tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}

/// Short id prefix per type.
const fn id_prefix(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Network => "net",
        ResourceType::SubnetGroup => "subnets",
        ResourceType::Cluster => "cluster",
        ResourceType::CapacityGroup => "asg",
        ResourceType::Repository => "repo",
        ResourceType::TaskDefinition => "taskdef",
        ResourceType::Service => "svc",
        ResourceType::LoadBalancer => "alb",
        ResourceType::Listener => "listener",
        ResourceType::TargetGroup => "tg",
        ResourceType::ScalingPolicy => "scaling",
        ResourceType::Output => "output",
    }
}

/// Fabricates the exported attributes of a resource.
fn outputs_for(provider_id: &str, resource: &ResolvedResource) -> ProvisionedResource {
    let arn = format!(
        "arn:sandbox:{}:{}:{provider_id}",
        resource.resource_type, resource.stack
    );
    let base = ProvisionedResource::new(provider_id);

    match resource.resource_type {
        ResourceType::Network => base.with_output(
            "cidr",
            resource
                .properties
                .get("cidr")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        ),
        ResourceType::Cluster
        | ResourceType::TaskDefinition
        | ResourceType::Listener
        | ResourceType::TargetGroup => base.with_output("arn", arn),
        ResourceType::Repository => base.with_output(
            "uri",
            format!(
                "registry.sandbox.local/{}",
                resource.property_str("repository_name").unwrap_or(&resource.name)
            ),
        ),
        ResourceType::Service => base.with_output(
            "name",
            resource
                .property_str("service_name")
                .map_or_else(|| format!("{}-{}", resource.stack, resource.name), String::from),
        ),
        ResourceType::LoadBalancer => base
            .with_output(
                "dns_name",
                format!("{}-{}.{provider_id}.elb.sandbox.local", resource.stack, resource.name),
            )
            .with_output("arn", arn),
        ResourceType::Output => base.with_output(
            "value",
            resource
                .properties
                .get("value")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        ),
        ResourceType::SubnetGroup | ResourceType::CapacityGroup | ResourceType::ScalingPolicy => {
            base
        }
    }
}

#[async_trait]
impl Provider for SandboxProvider {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn create(&self, resource: &ResolvedResource, token: &str) -> Result<ProvisionedResource> {
        self.before_call("create", &resource.name).await?;

        let mut inventory = self.inventory.lock().await;

        if let Some(existing_id) = inventory.tokens.get(token).cloned()
            && let Some(existing) = inventory.resources.get(&existing_id)
        {
            debug!("Sandbox create replayed for token {token}");
            return Ok(ProvisionedResource {
                provider_id: existing_id,
                outputs: existing.outputs.clone(),
            });
        }

        inventory.next_id += 1;
        let provider_id = format!("{}-{:06}", id_prefix(resource.resource_type), inventory.next_id);
        let provisioned = outputs_for(&provider_id, resource);

        inventory.resources.insert(
            provider_id.clone(),
            SandboxResource {
                name: resource.name.clone(),
                resource_type: resource.resource_type,
                properties: resource.properties.clone(),
                outputs: provisioned.outputs.clone(),
                tags: resource.tags.clone(),
            },
        );
        inventory.tokens.insert(token.to_string(), provider_id.clone());
        self.persist(&inventory).await?;

        debug!("Sandbox created {} as {provider_id}", resource.identity());
        Ok(provisioned)
    }

    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        token: &str,
    ) -> Result<ProvisionedResource> {
        self.before_call("update", &resource.name).await?;

        let mut inventory = self.inventory.lock().await;

        let provisioned = outputs_for(provider_id, resource);
        let Some(existing) = inventory.resources.get_mut(provider_id) else {
            return Err(StackError::Provider(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            }));
        };

        existing.properties = resource.properties.clone();
        existing.outputs = provisioned.outputs.clone();
        existing.tags.clone_from(&resource.tags);
        inventory.tokens.insert(token.to_string(), provider_id.to_string());
        self.persist(&inventory).await?;

        debug!("Sandbox updated {} ({provider_id})", resource.identity());
        Ok(provisioned)
    }

    async fn delete(&self, provider_id: &str, token: &str) -> Result<()> {
        let name = self
            .inventory
            .lock()
            .await
            .resources
            .get(provider_id)
            .map_or_else(|| provider_id.to_string(), |r| r.name.clone());
        self.before_call("delete", &name).await?;

        let mut inventory = self.inventory.lock().await;

        if inventory.resources.remove(provider_id).is_none() {
            return Err(StackError::Provider(ProviderError::NotFound {
                provider_id: provider_id.to_string(),
            }));
        }
        inventory.tokens.retain(|_, id| id != provider_id);
        self.persist(&inventory).await?;

        debug!("Sandbox deleted {provider_id} (token {token})");
        Ok(())
    }
}
