//! Specification hashing for change detection.
//!
//! Hashes are computed over a canonical JSON rendering so that key order and
//! formatting in the description never produce spurious changes.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use super::catalog::ResourceType;
use super::spec::{PropertyValue, StackDescription};

/// Hasher for resource specifications and idempotency tokens.
#[derive(Debug, Default)]
pub struct SpecHasher;

impl SpecHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a single resource specification.
    ///
    /// References are hashed by their expression, not by the value they
    /// resolve to, so a resource is unchanged as long as its declaration is.
    /// The stack tags are stamped on every resource and hashed with it.
    #[must_use]
    pub fn hash_resource(
        &self,
        resource_type: ResourceType,
        properties: &BTreeMap<String, PropertyValue>,
        dependencies: &BTreeSet<String>,
        tags: &BTreeMap<String, String>,
    ) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource_type.as_str().as_bytes());
        hasher.update([0u8]);

        // BTreeMap iteration is sorted; serde_json objects are sorted too
        for (key, value) in properties {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_canonical().to_string().as_bytes());
            hasher.update([0u8]);
        }

        hasher.update([1u8]);
        for dependency in dependencies {
            hasher.update(dependency.as_bytes());
            hasher.update([0u8]);
        }

        hasher.update([2u8]);
        for (key, value) in tags {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the whole description.
    ///
    /// Used to tag plans and history entries.
    #[must_use]
    pub fn hash_description(&self, description: &StackDescription) -> String {
        let mut hasher = Sha256::new();

        hasher.update(description.version.to_be_bytes());
        hasher.update(description.stack.prefix.as_bytes());
        hasher.update(description.stack.stage.as_bytes());
        if let Some(region) = &description.stack.region {
            hasher.update(region.as_bytes());
        }
        for (key, value) in &description.stack.tags {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }

        for resource in &description.resources {
            let dependencies: BTreeSet<String> = resource.depends_on.iter().cloned().collect();
            hasher.update(resource.name.as_bytes());
            hasher.update(
                self.hash_resource(
                    resource.resource_type,
                    &resource.properties,
                    &dependencies,
                    &description.stack.tags,
                )
                .as_bytes(),
            );
        }

        hex::encode(hasher.finalize())
    }

    /// Derives the idempotency token for one provider call.
    ///
    /// The token is stable across retries of the same call: it depends on the
    /// resource identity, the desired spec hash and a discriminator naming the
    /// operation (and the provider id it acts upon, if any).
    #[must_use]
    pub fn idempotency_token(&self, identity: &str, spec_hash: &str, discriminator: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        hasher.update([0u8]);
        hasher.update(spec_hash.as_bytes());
        hasher.update([0u8]);
        hasher.update(discriminator.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_properties(cidr: &str) -> BTreeMap<String, PropertyValue> {
        BTreeMap::from([
            (String::from("cidr"), PropertyValue::literal(cidr)),
            (String::from("max_azs"), PropertyValue::literal(2)),
        ])
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = SpecHasher::new();
        let props = network_properties("10.0.0.0/16");

        let hash1 = hasher.hash_resource(ResourceType::Network, &props, &BTreeSet::new(), &BTreeMap::new());
        let hash2 =
            hasher.hash_resource(ResourceType::Network, &props.clone(), &BTreeSet::new(), &BTreeMap::new());

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_property_change_changes_hash() {
        let hasher = SpecHasher::new();
        let before = hasher.hash_resource(
            ResourceType::Network,
            &network_properties("10.0.0.0/16"),
            &BTreeSet::new(),
            &BTreeMap::new(),
        );
        let after = hasher.hash_resource(
            ResourceType::Network,
            &network_properties("10.1.0.0/16"),
            &BTreeSet::new(),
            &BTreeMap::new(),
        );

        assert_ne!(before, after);
    }

    #[test]
    fn test_stack_tag_change_changes_hash() {
        let hasher = SpecHasher::new();
        let props = network_properties("10.0.0.0/16");
        let dev = BTreeMap::from([(String::from("env"), String::from("dev"))]);
        let prod = BTreeMap::from([(String::from("env"), String::from("prod"))]);

        assert_ne!(
            hasher.hash_resource(ResourceType::Network, &props, &BTreeSet::new(), &dev),
            hasher.hash_resource(ResourceType::Network, &props, &BTreeSet::new(), &prod)
        );
    }

    #[test]
    fn test_type_is_part_of_hash() {
        let hasher = SpecHasher::new();
        let props = BTreeMap::new();

        assert_ne!(
            hasher.hash_resource(ResourceType::Cluster, &props, &BTreeSet::new(), &BTreeMap::new()),
            hasher.hash_resource(ResourceType::Service, &props, &BTreeSet::new(), &BTreeMap::new())
        );
    }

    #[test]
    fn test_idempotency_token_stable() {
        let hasher = SpecHasher::new();
        let a = hasher.idempotency_token("network/vpc", "abc", "create");
        let b = hasher.idempotency_token("network/vpc", "abc", "create");
        let c = hasher.idempotency_token("network/vpc", "abc", "replace:net-1");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_hash() {
        let hasher = SpecHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(SpecHasher::hashes_match("abc123", "abc123"));
        assert!(!SpecHasher::hashes_match("abc123", "abc124"));
        assert!(!SpecHasher::hashes_match("abc123", "abc12"));
    }
}
