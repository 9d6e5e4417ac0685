//! Resource type catalogue.
//!
//! Each resource type carries a fixed table of properties whose change forces
//! a replacement, the output attributes it exports to dependents, and the
//! properties a declaration must set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of resources a stack can declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    /// Virtual network spanning availability zones.
    Network,
    /// Group of subnets of one tier inside a network.
    SubnetGroup,
    /// Container cluster.
    Cluster,
    /// Instance capacity attached to a cluster.
    CapacityGroup,
    /// Container image repository.
    Repository,
    /// Container task definition.
    TaskDefinition,
    /// Long-running container service.
    Service,
    /// Application load balancer.
    LoadBalancer,
    /// Load balancer listener.
    Listener,
    /// Target group routing listener traffic to a service.
    TargetGroup,
    /// Autoscaling parameters for a service.
    ScalingPolicy,
    /// Exported stack output.
    Output,
}

impl ResourceType {
    /// Every resource type, in catalogue order.
    pub const ALL: [Self; 12] = [
        Self::Network,
        Self::SubnetGroup,
        Self::Cluster,
        Self::CapacityGroup,
        Self::Repository,
        Self::TaskDefinition,
        Self::Service,
        Self::LoadBalancer,
        Self::Listener,
        Self::TargetGroup,
        Self::ScalingPolicy,
        Self::Output,
    ];

    /// Properties whose change cannot be applied in place.
    #[must_use]
    pub const fn replacement_triggers(self) -> &'static [&'static str] {
        match self {
            Self::Network => &["cidr", "max_azs"],
            Self::SubnetGroup => &["network", "subnet_type", "cidr_mask"],
            Self::Cluster => &["network"],
            Self::CapacityGroup => &["cluster", "instance_type"],
            Self::Repository => &["repository_name"],
            Self::TaskDefinition => &["launch_type", "cpu", "memory"],
            Self::Service => &["cluster", "launch_type"],
            Self::LoadBalancer => &["network", "internet_facing"],
            Self::Listener => &["load_balancer", "port", "protocol"],
            Self::TargetGroup => &["listener", "port", "protocol"],
            Self::ScalingPolicy => &["service"],
            Self::Output => &["export_name"],
        }
    }

    /// Output attributes available to references.
    #[must_use]
    pub const fn exports(self) -> &'static [&'static str] {
        match self {
            Self::Network => &["id", "cidr"],
            Self::Cluster | Self::TaskDefinition | Self::Listener | Self::TargetGroup => {
                &["id", "arn"]
            }
            Self::Repository => &["id", "uri"],
            Self::Service => &["id", "name"],
            Self::LoadBalancer => &["id", "dns_name", "arn"],
            Self::Output => &["id", "value"],
            Self::SubnetGroup | Self::CapacityGroup | Self::ScalingPolicy => &["id"],
        }
    }

    /// Properties a declaration of this type must set.
    #[must_use]
    pub const fn required_properties(self) -> &'static [&'static str] {
        match self {
            Self::Network => &["cidr"],
            Self::SubnetGroup => &["network", "subnet_type"],
            Self::Cluster => &["network"],
            Self::CapacityGroup => &["cluster", "instance_type"],
            Self::Repository => &["repository_name"],
            Self::TaskDefinition => &["cpu", "memory", "image"],
            Self::Service => &["cluster", "task_definition"],
            Self::LoadBalancer => &["network"],
            Self::Listener => &["load_balancer", "port"],
            Self::TargetGroup => &["listener", "port"],
            Self::ScalingPolicy => &["service", "min_capacity", "max_capacity"],
            Self::Output => &["export_name", "value"],
        }
    }

    /// Returns true if a change to `property` forces a replacement.
    #[must_use]
    pub fn replaces_on(self, property: &str) -> bool {
        self.replacement_triggers().contains(&property)
    }

    /// Returns true if the type exports `attribute`.
    #[must_use]
    pub fn exports_attribute(self, attribute: &str) -> bool {
        self.exports().contains(&attribute)
    }

    /// Returns the kebab-case name used in descriptions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::SubnetGroup => "subnet-group",
            Self::Cluster => "cluster",
            Self::CapacityGroup => "capacity-group",
            Self::Repository => "repository",
            Self::TaskDefinition => "task-definition",
            Self::Service => "service",
            Self::LoadBalancer => "load-balancer",
            Self::Listener => "listener",
            Self::TargetGroup => "target-group",
            Self::ScalingPolicy => "scaling-policy",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_type_exports_id() {
        for resource_type in ResourceType::ALL {
            assert!(resource_type.exports_attribute("id"), "{resource_type}");
        }
    }

    #[test]
    fn test_replacement_table() {
        assert!(ResourceType::Network.replaces_on("cidr"));
        assert!(!ResourceType::Network.replaces_on("tags"));
        assert!(ResourceType::TaskDefinition.replaces_on("memory"));
        assert!(!ResourceType::Service.replaces_on("desired_count"));
    }

    #[test]
    fn test_serde_name_matches_display() {
        for resource_type in ResourceType::ALL {
            let yaml = serde_yaml::to_string(&resource_type).unwrap();
            assert_eq!(yaml.trim(), resource_type.to_string());
        }
    }
}
