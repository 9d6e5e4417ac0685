//! Stack description types.
//!
//! This module defines the structs that map to the `stackwright.yaml` file.
//! A description is declarative: it names every resource of the stack, its
//! typed properties and the references between resources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

use super::catalog::ResourceType;

/// Description schema version understood by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// The root structure of a stack description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StackDescription {
    /// Schema version of the description format.
    pub version: u32,
    /// Stack-level configuration.
    pub stack: StackConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provisioning collaborator configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Apply engine tuning.
    #[serde(default)]
    pub apply: ApplySettings,
    /// Resources in declaration order.
    #[serde(default, with = "ordered_resources")]
    pub resources: Vec<ResourceDecl>,
}

/// Stack-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    /// Name prefix shared by every resource of the stack.
    pub prefix: String,
    /// Deployment stage (e.g. "dev", "staging", "prod").
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Target region.
    #[serde(default)]
    pub region: Option<String>,
    /// Tags applied to every resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provisioning collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Which collaborator performs the provisioning.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the provisioning API (http provider).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Inventory file for the sandbox provider.
    #[serde(default)]
    pub inventory: Option<String>,
    /// HTTP request timeout in seconds (http provider).
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Provisioning collaborator kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local sandbox that records resources without touching a cloud.
    #[default]
    Sandbox,
    /// Remote provisioning API spoken over HTTP.
    Http,
}

/// Apply engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(deny_unknown_fields)]
pub struct ApplySettings {
    /// Maximum number of operations running at once.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,
    /// Maximum attempts per operation for transient failures.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Initial retry backoff in milliseconds (doubled per attempt).
    #[serde(default = "default_base_backoff_ms")]
    #[validate(range(min = 1, max = 60_000))]
    pub base_backoff_ms: u64,
    /// Upper bound for a single retry backoff in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub max_backoff_ms: u64,
    /// Deadline for a single provider call in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    #[validate(range(min = 1, max = 86_400))]
    pub operation_timeout_secs: u64,
}

/// A single declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecl {
    /// Unique resource name within the stack.
    pub name: String,
    /// Resource type.
    pub resource_type: ResourceType,
    /// Property bag.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Explicit dependencies not expressed through property references.
    pub depends_on: Vec<String>,
}

/// Body of a resource entry as written in the description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceBody {
    #[serde(rename = "type")]
    resource_type: ResourceType,
    #[serde(default)]
    properties: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
}

/// A property value: a reference to another resource's output, a nested
/// list or map, or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Reference to another resource's output attribute.
    Reference(Reference),
    /// List of values.
    List(Vec<PropertyValue>),
    /// Nested map of values.
    Map(BTreeMap<String, PropertyValue>),
    /// Scalar literal.
    Literal(serde_json::Value),
}

/// Reference to an output attribute of another resource, written
/// `{ ref: "<resource>.<attribute>" }`. The attribute defaults to `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ReferenceRepr", into = "ReferenceRepr")]
pub struct Reference {
    /// Referenced resource name.
    pub resource: String,
    /// Referenced output attribute.
    pub attribute: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReferenceRepr {
    #[serde(rename = "ref")]
    target: String,
}

// Default value functions

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_operation_timeout_secs() -> u64 {
    600
}

fn default_stage() -> String {
    String::from("dev")
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl StackDescription {
    /// Returns the qualified stack name (`<prefix>-<stage>`).
    #[must_use]
    pub fn qualified_name(&self) -> String {
        self.stack.qualified_name()
    }

    /// Looks up a resource declaration by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }
}

impl StackConfig {
    /// Returns the qualified stack name (`<prefix>-<stage>`).
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.prefix, self.stage)
    }
}

impl ResourceDecl {
    /// Creates a declaration with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            name: name.into(),
            resource_type,
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Returns every reference held in the property bag.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for value in self.properties.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    fn from_body(name: String, body: ResourceBody) -> Self {
        Self {
            name,
            resource_type: body.resource_type,
            properties: body.properties,
            depends_on: body.depends_on,
        }
    }

    fn to_body(&self) -> ResourceBody {
        ResourceBody {
            resource_type: self.resource_type,
            properties: self.properties.clone(),
            depends_on: self.depends_on.clone(),
        }
    }
}

impl PropertyValue {
    /// Creates a literal value.
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Creates a reference value from `<resource>.<attribute>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression is malformed.
    pub fn reference(expr: &str) -> Result<Self, String> {
        Reference::parse(expr).map(Self::Reference)
    }

    /// Returns the canonical JSON form: literals as-is, references as
    /// `{"ref": "<resource>.<attribute>"}`.
    #[must_use]
    pub fn to_canonical(&self) -> serde_json::Value {
        match self {
            Self::Reference(r) => serde_json::json!({ "ref": r.to_string() }),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_canonical).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_canonical()))
                    .collect(),
            ),
            Self::Literal(value) => value.clone(),
        }
    }

    /// Replaces every reference with the value returned by `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` could not resolve.
    pub fn resolve<F>(&self, lookup: &F) -> Result<serde_json::Value, Reference>
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        match self {
            Self::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Self::Map(entries) => {
                let mut resolved = serde_json::Map::new();
                for (k, v) in entries {
                    resolved.insert(k.clone(), v.resolve(lookup)?);
                }
                Ok(serde_json::Value::Object(resolved))
            }
            Self::Literal(value) => Ok(value.clone()),
        }
    }

    /// Returns the literal as a string slice, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Literal(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the literal as an unsigned integer, if it is one.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Literal(value) => value.as_u64(),
            _ => None,
        }
    }

    /// Returns the literal as a boolean, if it is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Literal(value) => value.as_bool(),
            _ => None,
        }
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(r) => out.push(r),
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            Self::Literal(_) => {}
        }
    }
}

impl Reference {
    /// Parses a reference expression like `vpc.id` or `alb.dns_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource or attribute part is empty.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let (resource, attribute) = expr.split_once('.').unwrap_or((expr, "id"));

        if resource.is_empty() {
            return Err(format!("Invalid reference '{expr}': missing resource name"));
        }
        if attribute.is_empty() {
            return Err(format!("Invalid reference '{expr}': missing attribute"));
        }

        Ok(Self {
            resource: resource.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

impl TryFrom<ReferenceRepr> for Reference {
    type Error = String;

    fn try_from(repr: ReferenceRepr) -> Result<Self, Self::Error> {
        Self::parse(&repr.target)
    }
}

impl From<Reference> for ReferenceRepr {
    fn from(reference: Reference) -> Self {
        Self {
            target: reference.to_string(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// Resources are written as a YAML mapping but kept in declaration order.
mod ordered_resources {
    use super::{ResourceBody, ResourceDecl};
    use serde::de::{self, MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::collections::HashSet;
    use std::fmt;

    pub fn serialize<S: Serializer>(
        resources: &[ResourceDecl],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(resources.len()))?;
        for resource in resources {
            map.serialize_entry(&resource.name, &resource.to_body())?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ResourceDecl>, D::Error> {
        struct ResourcesVisitor;

        impl<'de> Visitor<'de> for ResourcesVisitor {
            type Value = Vec<ResourceDecl>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of resource name to resource definition")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut seen = HashSet::new();
                let mut resources = Vec::with_capacity(access.size_hint().unwrap_or(0));

                while let Some((name, body)) = access.next_entry::<String, ResourceBody>()? {
                    if !seen.insert(name.clone()) {
                        return Err(de::Error::custom(format!("duplicate resource name: {name}")));
                    }
                    resources.push(ResourceDecl::from_body(name, body));
                }

                Ok(resources)
            }
        }

        deserializer.deserialize_map(ResourcesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parse() {
        let r = Reference::parse("vpc.id").unwrap();
        assert_eq!(r.resource, "vpc");
        assert_eq!(r.attribute, "id");

        let r = Reference::parse("alb.dns_name").unwrap();
        assert_eq!(r.attribute, "dns_name");
    }

    #[test]
    fn test_reference_defaults_to_id() {
        let r = Reference::parse("cluster").unwrap();
        assert_eq!(r.attribute, "id");
        assert_eq!(r.to_string(), "cluster.id");
    }

    #[test]
    fn test_reference_invalid() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse(".id").is_err());
        assert!(Reference::parse("vpc.").is_err());
    }

    #[test]
    fn test_property_value_untagged() {
        let value: PropertyValue = serde_yaml::from_str("{ ref: vpc.id }").unwrap();
        assert!(matches!(value, PropertyValue::Reference(_)));

        let value: PropertyValue = serde_yaml::from_str("10.0.0.0/16").unwrap();
        assert_eq!(value.as_str(), Some("10.0.0.0/16"));

        let value: PropertyValue = serde_yaml::from_str("[ { ref: svc.id }, 3 ]").unwrap();
        let PropertyValue::List(items) = value else {
            panic!("expected list");
        };
        assert!(matches!(items[0], PropertyValue::Reference(_)));
        assert_eq!(items[1].as_u64(), Some(3));
    }

    #[test]
    fn test_nested_references_collected() {
        let decl = ResourceDecl::new("tg", ResourceType::TargetGroup)
            .with_property("listener", PropertyValue::reference("listener").unwrap())
            .with_property(
                "targets",
                PropertyValue::List(vec![PropertyValue::reference("svc.id").unwrap()]),
            );

        let refs: Vec<String> = decl.references().iter().map(ToString::to_string).collect();
        assert_eq!(refs, vec!["listener.id", "svc.id"]);
    }

    #[test]
    fn test_resolve_replaces_references() {
        let value = PropertyValue::Map(BTreeMap::from([
            (String::from("network"), PropertyValue::reference("vpc.id").unwrap()),
            (String::from("port"), PropertyValue::literal(80)),
        ]));

        let resolved = value
            .resolve(&|r: &Reference| (r.resource == "vpc").then(|| serde_json::json!("vpc-123")))
            .unwrap();
        assert_eq!(resolved, serde_json::json!({ "network": "vpc-123", "port": 80 }));

        let missing = value.resolve(&|_: &Reference| None);
        assert_eq!(missing.unwrap_err().resource, "vpc");
    }

    #[test]
    fn test_resources_keep_declaration_order() {
        let yaml = r"
version: 1
stack:
  prefix: demo
resources:
  zeta:
    type: network
    properties:
      cidr: 10.0.0.0/16
  alpha:
    type: cluster
    properties:
      network: { ref: zeta.id }
";
        let description: StackDescription = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(description.resource_names(), vec!["zeta", "alpha"]);
        assert_eq!(description.qualified_name(), "demo-dev");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r"
version: 1
stack:
  prefix: demo
resources:
  vpc:
    type: network
    propertiez: {}
";
        assert!(serde_yaml::from_str::<StackDescription>(yaml).is_err());
    }
}
