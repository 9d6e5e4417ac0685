//! Stack description validation.
//!
//! Validation runs before anything touches state or the provider. All
//! problems are collected; the first error is reported and warnings are kept
//! for display.

use ::validator::Validate;
use serde::Serialize;
use crate::error::{ConfigError, Result, StackError};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use tracing::debug;

use super::catalog::ResourceType;
use super::spec::{
    PropertyValue, ProviderKind, ResourceDecl, StackConfig, StackDescription, StateBackend,
};

/// Subnet tiers a subnet group may declare.
const SUBNET_TYPES: &[&str] = &["public", "private", "isolated"];

/// Launch types for task definitions, services and capacity.
const LAUNCH_TYPES: &[&str] = &["fargate", "ec2"];

/// Listener and target group protocols.
const PROTOCOLS: &[&str] = &["http", "https", "tcp"];

/// Validator for stack descriptions.
#[derive(Debug, Default)]
pub struct DescriptionValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Serialize)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl DescriptionValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack description.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, description: &StackDescription) -> Result<ValidationResult> {
        let result = self.check(description);

        if let Some(first_error) = result.errors.first() {
            return Err(StackError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!(
            "Description validation passed with {} warnings",
            result.warning_count()
        );
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, description: &StackDescription) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_stack(&description.stack, &mut result);
        Self::validate_backends(description, &mut result);
        Self::validate_apply(description, &mut result);
        Self::validate_resources(&description.resources, &mut result);

        result
    }

    fn validate_stack(stack: &StackConfig, result: &mut ValidationResult) {
        if stack.prefix.is_empty() {
            result.error("stack.prefix", "Stack prefix cannot be empty");
        } else if !is_valid_name(&stack.prefix) {
            result.error(
                "stack.prefix",
                format!(
                    "Stack prefix '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    stack.prefix
                ),
            );
        }

        if stack.stage.is_empty() {
            result.error("stack.stage", "Stage cannot be empty");
        } else if !is_valid_name(&stack.stage) {
            result.error(
                "stack.stage",
                format!(
                    "Stage '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    stack.stage
                ),
            );
        }
    }

    fn validate_backends(description: &StackDescription, result: &mut ValidationResult) {
        if description.state.backend == StateBackend::S3
            && description.state.bucket.as_ref().is_none_or(String::is_empty)
        {
            result.error(
                "state.bucket",
                "S3 bucket name is required when using S3 backend",
            );
        }

        if description.provider.kind == ProviderKind::Http {
            match description.provider.endpoint.as_deref() {
                None | Some("") => result.error(
                    "provider.endpoint",
                    "An endpoint is required when using the http provider",
                ),
                Some(endpoint)
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
                {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{endpoint}' must be an http(s) URL"),
                    );
                }
                Some(_) => {}
            }
        }
    }

    fn validate_apply(description: &StackDescription, result: &mut ValidationResult) {
        if let Err(errors) = description.apply.validate() {
            let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));

            for (field, field_errors) in fields {
                for error in field_errors {
                    result.error(
                        format!("apply.{field}"),
                        format!("Invalid apply setting '{field}': {}", error.code),
                    );
                }
            }
        }

        if description.apply.base_backoff_ms > description.apply.max_backoff_ms {
            result.error(
                "apply.base_backoff_ms",
                "base_backoff_ms cannot exceed max_backoff_ms",
            );
        }
    }

    fn validate_resources(resources: &[ResourceDecl], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in stack"));
            return;
        }

        let mut seen_names = HashSet::new();

        for resource in resources {
            let prefix = format!("resources.{}", resource.name);

            if !seen_names.insert(resource.name.as_str()) {
                result.error(
                    prefix.clone(),
                    format!("Duplicate resource name: {}", resource.name),
                );
            }

            if !is_valid_name(&resource.name) {
                result.error(
                    prefix.clone(),
                    format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                );
            }

            for required in resource.resource_type.required_properties() {
                if !resource.properties.contains_key(*required) {
                    result.error(
                        format!("{prefix}.properties.{required}"),
                        format!(
                            "{} '{}' requires property '{required}'",
                            resource.resource_type, resource.name
                        ),
                    );
                }
            }

            for (key, value) in &resource.properties {
                check_malformed_reference(value, &format!("{prefix}.properties.{key}"), result);
            }

            Self::validate_type_rules(resource, &prefix, result);
        }
    }

    fn validate_type_rules(resource: &ResourceDecl, prefix: &str, result: &mut ValidationResult) {
        let check = ResourceCheck {
            resource,
            prefix,
        };

        match resource.resource_type {
            ResourceType::Network => {
                if let Some(cidr) = resource.properties.get("cidr").and_then(PropertyValue::as_str)
                    && !is_valid_cidr(cidr)
                {
                    result.error(
                        format!("{prefix}.properties.cidr"),
                        format!("'{cidr}' is not a valid IPv4 CIDR block"),
                    );
                }
                check.number("max_azs", 1..=16, result);
                check.number("nat_gateways", 0..=16, result);
            }
            ResourceType::SubnetGroup => {
                check.one_of("subnet_type", SUBNET_TYPES, result);
                check.number("cidr_mask", 16..=28, result);
            }
            ResourceType::CapacityGroup => {
                check.capacity_bounds(result);
            }
            ResourceType::TaskDefinition => {
                check.number("cpu", 1..=u64::from(u32::MAX), result);
                check.number("memory", 1..=u64::from(u32::MAX), result);
                check.number("container_port", 1..=65_535, result);
                check.one_of("launch_type", LAUNCH_TYPES, result);
                if let Some(image) = resource.properties.get("image").and_then(PropertyValue::as_str)
                    && image.ends_with(":latest")
                {
                    result.warnings.push(format!(
                        "{prefix}.properties.image: Using ':latest' tag is not recommended for production"
                    ));
                }
            }
            ResourceType::Service => {
                check.number("desired_count", 0..=1_000, result);
                check.one_of("launch_type", LAUNCH_TYPES, result);
            }
            ResourceType::Listener | ResourceType::TargetGroup => {
                check.number("port", 1..=65_535, result);
                check.one_of("protocol", PROTOCOLS, result);
            }
            ResourceType::ScalingPolicy => {
                check.capacity_bounds(result);
                check.number("cpu_target_percent", 1..=100, result);
                check.number("requests_per_target", 1..=u64::from(u32::MAX), result);
            }
            ResourceType::Cluster
            | ResourceType::Repository
            | ResourceType::LoadBalancer
            | ResourceType::Output => {}
        }
    }
}

/// Property checks scoped to one declaration.
struct ResourceCheck<'a> {
    resource: &'a ResourceDecl,
    prefix: &'a str,
}

impl ResourceCheck<'_> {
    /// Literal numbers must fall in `range`; references are checked at apply.
    fn number(&self, key: &str, range: RangeInclusive<u64>, result: &mut ValidationResult) {
        let Some(value) = self.resource.properties.get(key) else {
            return;
        };
        if matches!(value, PropertyValue::Reference(_)) {
            return;
        }

        match value.as_u64() {
            Some(n) if range.contains(&n) => {}
            _ => result.error(
                format!("{}.properties.{key}", self.prefix),
                format!(
                    "'{key}' of '{}' must be an integer in {}..={}",
                    self.resource.name,
                    range.start(),
                    range.end()
                ),
            ),
        }
    }

    fn one_of(&self, key: &str, allowed: &[&str], result: &mut ValidationResult) {
        let Some(value) = self.resource.properties.get(key) else {
            return;
        };
        if matches!(value, PropertyValue::Reference(_)) {
            return;
        }

        if !value.as_str().is_some_and(|v| allowed.contains(&v)) {
            result.error(
                format!("{}.properties.{key}", self.prefix),
                format!(
                    "'{key}' of '{}' must be one of: {}",
                    self.resource.name,
                    allowed.join(", ")
                ),
            );
        }
    }

    fn capacity_bounds(&self, result: &mut ValidationResult) {
        self.number("min_capacity", 1..=10_000, result);
        self.number("max_capacity", 1..=10_000, result);

        let min = self
            .resource
            .properties
            .get("min_capacity")
            .and_then(PropertyValue::as_u64);
        let max = self
            .resource
            .properties
            .get("max_capacity")
            .and_then(PropertyValue::as_u64);

        if let (Some(min), Some(max)) = (min, max)
            && min > max
        {
            result.error(
                format!("{}.properties.min_capacity", self.prefix),
                format!(
                    "min_capacity ({min}) of '{}' exceeds max_capacity ({max})",
                    self.resource.name
                ),
            );
        }
    }
}

/// A map with a `ref` key that did not parse as a reference is a typo.
fn check_malformed_reference(value: &PropertyValue, field: &str, result: &mut ValidationResult) {
    match value {
        PropertyValue::Map(entries) => {
            if entries.contains_key("ref") {
                result.error(
                    field,
                    "Malformed reference. Expected { ref: \"<resource>.<attribute>\" }",
                );
            }
            for (key, nested) in entries {
                check_malformed_reference(nested, &format!("{field}.{key}"), result);
            }
        }
        PropertyValue::List(items) => {
            for (i, item) in items.iter().enumerate() {
                check_malformed_reference(item, &format!("{field}[{i}]"), result);
            }
        }
        PropertyValue::Reference(_) | PropertyValue::Literal(_) => {}
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Checks an IPv4 CIDR block such as `10.0.0.0/16`.
fn is_valid_cidr(cidr: &str) -> bool {
    let Some((address, mask)) = cidr.split_once('/') else {
        return false;
    };

    let mask_ok = mask.parse::<u8>().is_ok_and(|m| m <= 32);
    mask_ok && address.parse::<std::net::Ipv4Addr>().is_ok()
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DescriptionParser;

    fn parse(yaml: &str) -> StackDescription {
        DescriptionParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("vpc"));
        assert!(is_valid_name("web-service-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Vpc")); // uppercase
        assert!(!is_valid_name("1vpc")); // starts with number
        assert!(!is_valid_name("web_service")); // underscore
        assert!(!is_valid_name("vpc-")); // ends with hyphen
        assert!(!is_valid_name("web--service")); // consecutive hyphens
    }

    #[test]
    fn test_cidr() {
        assert!(is_valid_cidr("10.0.0.0/16"));
        assert!(is_valid_cidr("0.0.0.0/0"));
        assert!(!is_valid_cidr("10.0.0.0"));
        assert!(!is_valid_cidr("10.0.0.0/33"));
        assert!(!is_valid_cidr("10.0.0.256/16"));
    }

    #[test]
    fn test_valid_description() {
        let description = parse(
            r"
version: 1
stack:
  prefix: demo
resources:
  vpc:
    type: network
    properties: { cidr: 10.0.0.0/16, max_azs: 2 }
  scaling:
    type: scaling-policy
    properties: { service: { ref: svc }, min_capacity: 2, max_capacity: 10, cpu_target_percent: 50 }
",
        );

        let result = DescriptionValidator::new().validate(&description).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_bad_cidr_is_error() {
        let description = parse(
            r"
version: 1
stack:
  prefix: demo
resources:
  vpc:
    type: network
    properties: { cidr: 10.0.0/16 }
",
        );

        let err = DescriptionValidator::new().validate(&description).unwrap_err();
        assert!(err.to_string().contains("not a valid IPv4 CIDR"));
    }

    #[test]
    fn test_capacity_bounds() {
        let description = parse(
            r"
version: 1
stack:
  prefix: demo
resources:
  scaling:
    type: scaling-policy
    properties: { service: svc, min_capacity: 5, max_capacity: 2 }
",
        );

        let result = DescriptionValidator::new().check(&description);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("exceeds max_capacity"));
    }

    #[test]
    fn test_missing_required_property() {
        let description = parse(
            r"
version: 1
stack:
  prefix: demo
resources:
  listener:
    type: listener
    properties: { port: 80 }
",
        );

        let result = DescriptionValidator::new().check(&description);
        assert_eq!(result.errors[0].field, "resources.listener.properties.load_balancer");
    }

    #[test]
    fn test_apply_settings_range() {
        let mut description = parse("version: 1\nstack:\n  prefix: demo\n");
        description.apply.concurrency = 0;

        let result = DescriptionValidator::new().check(&description);
        assert!(result.errors.iter().any(|e| e.field == "apply.concurrency"));
    }

    #[test]
    fn test_warnings() {
        let description = parse(
            r"
version: 1
stack:
  prefix: demo
resources:
  task:
    type: task-definition
    properties: { cpu: 256, memory: 512, image: 'app:latest' }
",
        );

        let result = DescriptionValidator::new().validate(&description).unwrap();
        assert_eq!(result.warning_count(), 1);

        let empty = parse("version: 1\nstack:\n  prefix: demo\n");
        let result = DescriptionValidator::new().validate(&empty).unwrap();
        assert_eq!(result.warnings, vec!["No resources defined in stack"]);
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let description = parse(
            r"
version: 1
stack:
  prefix: demo
provider:
  kind: http
",
        );

        let result = DescriptionValidator::new().check(&description);
        assert_eq!(result.errors[0].field, "provider.endpoint");
    }
}
