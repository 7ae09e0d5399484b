use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_domain::{NodeId, NodeStatus, Outputs, ResourceType};

use crate::error::ProviderError;

type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// The node a provider call acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub node: NodeId,
    pub resource_type: ResourceType,
    /// Outputs recorded by the last successful apply, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_outputs: Option<Outputs>,
}

/// A resource as the provider currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observed {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default = "observed_status")]
    pub status: NodeStatus,
}

const fn observed_status() -> NodeStatus {
    NodeStatus::Complete
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
}

/// Result of a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    pub id: String,
    #[serde(default)]
    pub outputs: Outputs,
}

/// Provisioning contract for one or more resource types.
///
/// Inputs handed to `create` and `update` are fully resolved. Every call may
/// fail with a [`ProviderError`]; the engine records it on the node.
#[async_trait]
pub trait ResourceExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the provider has no resource with `id`.
    async fn get(&self, target: &Target, id: &str) -> ProviderResult<Option<Observed>>;

    async fn list(&self, filter: &ListFilter) -> ProviderResult<Vec<Observed>>;

    async fn create(&self, target: &Target, inputs: &Value) -> ProviderResult<Provisioned>;

    async fn update(&self, target: &Target, id: &str, inputs: &Value) -> ProviderResult<Outputs>;

    async fn delete(&self, target: &Target, id: &str) -> ProviderResult<()>;
}

/// Resource type to executor mapping handed to the engine at construction.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    executors: BTreeMap<ResourceType, Arc<dyn ResourceExecutor>>,
    fallback: Option<Arc<dyn ResourceExecutor>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_executors(
        executors: impl IntoIterator<Item = (ResourceType, Arc<dyn ResourceExecutor>)>,
    ) -> Self {
        Self {
            executors: executors.into_iter().collect(),
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_executor(
        mut self,
        resource_type: ResourceType,
        executor: Arc<dyn ResourceExecutor>,
    ) -> Self {
        self.executors.insert(resource_type, executor);
        self
    }

    /// Executor used for every resource type without a dedicated one.
    #[must_use]
    pub fn with_fallback(mut self, executor: Arc<dyn ResourceExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    /// # Errors
    ///
    /// Returns [`ProviderError::NotRegistered`] when no executor handles `resource_type`.
    pub fn select(&self, resource_type: ResourceType) -> ProviderResult<Arc<dyn ResourceExecutor>> {
        self.executors
            .get(&resource_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or(ProviderError::NotRegistered { resource_type })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::sync::Arc;

    use strata_domain::ResourceType;

    use super::ProviderRegistry;
    use crate::error::ProviderError;
    use crate::testing::ScriptedExecutor;

    #[test]
    fn selects_dedicated_executor_before_fallback() {
        let registry = ProviderRegistry::new()
            .with_executor(ResourceType::Database, Arc::new(ScriptedExecutor::named("db")))
            .with_fallback(Arc::new(ScriptedExecutor::named("any")));

        let executor = registry.select(ResourceType::Database).expect("database");
        assert_eq!(executor.name(), "db");
        let executor = registry.select(ResourceType::Bucket).expect("fallback");
        assert_eq!(executor.name(), "any");
    }

    #[test]
    fn missing_executor_is_a_provider_error() {
        let registry = ProviderRegistry::from_executors([(
            ResourceType::Secret,
            Arc::new(ScriptedExecutor::named("secrets")) as Arc<dyn super::ResourceExecutor>,
        )]);
        let executor = registry.select(ResourceType::Secret).expect("secret");
        assert_eq!(executor.name(), "secrets");
        let Err(error) = registry.select(ResourceType::Bucket) else {
            unreachable!("bucket has no executor");
        };
        assert_eq!(
            error,
            ProviderError::NotRegistered {
                resource_type: ResourceType::Bucket
            }
        );
    }
}
