use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::DomainValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Database,
    DatabaseSchema,
    DatabaseUser,
    KubernetesCluster,
    Namespace,
    Deployment,
    Service,
    IngressRule,
    Bucket,
    Secret,
    DnsZone,
    DnsRecord,
    Volume,
    ContainerBuild,
    Cronjob,
}

/// Static shape of a resource type: which inputs must be present, which
/// outputs a provider publishes, and which input fields cannot be changed
/// in place.
///
/// Any top-level input field not listed in `replace_on_change` is treated
/// as update-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSchema {
    pub required_inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
    pub replace_on_change: &'static [&'static str],
}

impl ResourceSchema {
    #[must_use]
    pub fn forces_replacement(&self, field: &str) -> bool {
        self.replace_on_change.contains(&field)
    }
}

impl ResourceType {
    pub const ALL: [Self; 15] = [
        Self::Database,
        Self::DatabaseSchema,
        Self::DatabaseUser,
        Self::KubernetesCluster,
        Self::Namespace,
        Self::Deployment,
        Self::Service,
        Self::IngressRule,
        Self::Bucket,
        Self::Secret,
        Self::DnsZone,
        Self::DnsRecord,
        Self::Volume,
        Self::ContainerBuild,
        Self::Cronjob,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::DatabaseSchema => "database_schema",
            Self::DatabaseUser => "database_user",
            Self::KubernetesCluster => "kubernetes_cluster",
            Self::Namespace => "namespace",
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::IngressRule => "ingress_rule",
            Self::Bucket => "bucket",
            Self::Secret => "secret",
            Self::DnsZone => "dns_zone",
            Self::DnsRecord => "dns_record",
            Self::Volume => "volume",
            Self::ContainerBuild => "container_build",
            Self::Cronjob => "cronjob",
        }
    }

    #[must_use]
    pub const fn schema(self) -> ResourceSchema {
        match self {
            Self::Database => ResourceSchema {
                required_inputs: &["engine", "version"],
                outputs: &["id", "host", "port", "protocol", "username", "password", "url"],
                replace_on_change: &["engine", "region", "name"],
            },
            Self::DatabaseSchema => ResourceSchema {
                required_inputs: &["database", "name"],
                outputs: &["id", "host", "port", "username", "password", "url"],
                replace_on_change: &["database", "name"],
            },
            Self::DatabaseUser => ResourceSchema {
                required_inputs: &["schema", "username"],
                outputs: &["id", "username", "password", "url"],
                replace_on_change: &["schema", "username"],
            },
            Self::KubernetesCluster => ResourceSchema {
                required_inputs: &["region", "version"],
                outputs: &["id", "endpoint", "kubeconfig"],
                replace_on_change: &["region", "vpc", "name"],
            },
            Self::Namespace => ResourceSchema {
                required_inputs: &["name"],
                outputs: &["id"],
                replace_on_change: &["name", "cluster"],
            },
            Self::Deployment => ResourceSchema {
                required_inputs: &["image"],
                outputs: &["id", "labels"],
                replace_on_change: &["namespace", "name"],
            },
            Self::Service => ResourceSchema {
                required_inputs: &["port"],
                outputs: &["id", "host", "port", "protocol", "url"],
                replace_on_change: &["namespace", "name"],
            },
            Self::IngressRule => ResourceSchema {
                required_inputs: &["service", "port"],
                outputs: &["id", "host", "path", "url"],
                replace_on_change: &["name", "internal"],
            },
            Self::Bucket => ResourceSchema {
                required_inputs: &["name"],
                outputs: &["id", "endpoint", "url"],
                replace_on_change: &["name", "region"],
            },
            Self::Secret => ResourceSchema {
                required_inputs: &[],
                outputs: &["id", "data"],
                replace_on_change: &["name"],
            },
            Self::DnsZone => ResourceSchema {
                required_inputs: &["name"],
                outputs: &["id", "name", "nameservers"],
                replace_on_change: &["name"],
            },
            Self::DnsRecord => ResourceSchema {
                required_inputs: &["zone", "name", "record_type", "content"],
                outputs: &["id", "fqdn"],
                replace_on_change: &["zone", "name", "record_type"],
            },
            Self::Volume => ResourceSchema {
                required_inputs: &["size"],
                outputs: &["id", "path"],
                replace_on_change: &["zone", "name"],
            },
            Self::ContainerBuild => ResourceSchema {
                required_inputs: &["context"],
                outputs: &["id", "image"],
                replace_on_change: &[],
            },
            Self::Cronjob => ResourceSchema {
                required_inputs: &["image", "schedule"],
                outputs: &["id"],
                replace_on_change: &["namespace", "name"],
            },
        }
    }

    /// Whether values of this resource type should be hidden from rendered output.
    #[must_use]
    pub const fn is_sensitive(self) -> bool {
        matches!(self, Self::Secret)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = DomainValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == value)
            .ok_or_else(|| DomainValidationError::UnknownResourceType {
                name: value.to_string(),
            })
    }
}
