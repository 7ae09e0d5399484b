use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_domain::{NodeId, Outputs, ResourceType};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::document::ModuleSpec;
use crate::error::ProviderError;
use crate::providers::{ListFilter, Observed, ProviderRegistry, Provisioned, ResourceExecutor, Target};

type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleAction {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl ModuleAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Serialized plan handed to an external provisioning module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequest {
    pub action: ModuleAction,
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_outputs: Option<Outputs>,
}

/// Serialized state a module sends back. A non-empty `error` marks a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Observed>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Observed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Remote procedure boundary to an external provisioning module.
#[async_trait]
pub trait ModuleRunner: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// Returns [`ProviderError::Unavailable`] when the module cannot be reached
    /// and [`ProviderError::Call`] when it answers with garbage.
    async fn run(&self, request: &ModuleRequest) -> ProviderResult<ModuleResponse>;
}

/// Runs a module as a child process: request JSON on stdin, response JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandModuleRunner {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandModuleRunner {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    /// `None` when `spec.command` is empty.
    #[must_use]
    pub fn from_spec(spec: &ModuleSpec) -> Option<Self> {
        let (program, args) = spec.command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: spec.env.clone(),
        })
    }

    fn unavailable(&self, reason: impl Into<String>) -> ProviderError {
        ProviderError::Unavailable {
            module: self.program.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ModuleRunner for CommandModuleRunner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn run(&self, request: &ModuleRequest) -> ProviderResult<ModuleResponse> {
        let operation = request.action.as_str();
        let payload = serde_json::to_vec(request).map_err(|source| ProviderError::Call {
            operation,
            message: format!("failed to encode module request: {source}"),
        })?;

        debug!(module = %self.program, action = operation, "running module");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => self.unavailable("program not found"),
                ErrorKind::PermissionDenied => self.unavailable("permission denied"),
                _ => self.unavailable(source.to_string()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A module that exits without reading its request is judged by its output.
            if let Err(source) = stdin.write_all(&payload).await
                && source.kind() != ErrorKind::BrokenPipe
            {
                return Err(self.unavailable(source.to_string()));
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| self.unavailable(source.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProviderError::Call {
                operation,
                message: if stderr.is_empty() {
                    format!("module exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }

        let response: ModuleResponse =
            serde_json::from_slice(&output.stdout).map_err(|source| ProviderError::Call {
                operation,
                message: format!("invalid module response: {source}"),
            })?;
        match response.error {
            Some(message) if !message.is_empty() => Err(ProviderError::Call { operation, message }),
            _ => Ok(response),
        }
    }
}

/// Adapts any [`ModuleRunner`] into a [`ResourceExecutor`].
pub struct ModuleExecutor<R> {
    runner: R,
}

impl<R: ModuleRunner> ModuleExecutor<R> {
    #[must_use]
    pub const fn new(runner: R) -> Self {
        Self { runner }
    }

    fn request(action: ModuleAction, target: &Target) -> ModuleRequest {
        ModuleRequest {
            action,
            resource_type: target.resource_type,
            node: Some(target.node.clone()),
            inputs: None,
            provider_id: None,
            previous_outputs: target.previous_outputs.clone(),
        }
    }
}

#[async_trait]
impl<R: ModuleRunner> ResourceExecutor for ModuleExecutor<R> {
    fn name(&self) -> &str {
        self.runner.name()
    }

    async fn get(&self, target: &Target, id: &str) -> ProviderResult<Option<Observed>> {
        let request = ModuleRequest {
            provider_id: Some(id.to_string()),
            ..Self::request(ModuleAction::Get, target)
        };
        Ok(self.runner.run(&request).await?.resource)
    }

    async fn list(&self, filter: &ListFilter) -> ProviderResult<Vec<Observed>> {
        let request = ModuleRequest {
            action: ModuleAction::List,
            resource_type: filter.resource_type,
            node: filter.node.clone(),
            inputs: None,
            provider_id: None,
            previous_outputs: None,
        };
        Ok(self.runner.run(&request).await?.rows)
    }

    async fn create(&self, target: &Target, inputs: &Value) -> ProviderResult<Provisioned> {
        let request = ModuleRequest {
            inputs: Some(inputs.clone()),
            ..Self::request(ModuleAction::Create, target)
        };
        let response = self.runner.run(&request).await?;
        let Some(id) = response.id else {
            return Err(ProviderError::Call {
                operation: "create",
                message: "module response has no id".to_string(),
            });
        };
        Ok(Provisioned {
            id,
            outputs: response.outputs,
        })
    }

    async fn update(&self, target: &Target, id: &str, inputs: &Value) -> ProviderResult<Outputs> {
        let request = ModuleRequest {
            inputs: Some(inputs.clone()),
            provider_id: Some(id.to_string()),
            ..Self::request(ModuleAction::Update, target)
        };
        Ok(self.runner.run(&request).await?.outputs)
    }

    async fn delete(&self, target: &Target, id: &str) -> ProviderResult<()> {
        let request = ModuleRequest {
            provider_id: Some(id.to_string()),
            ..Self::request(ModuleAction::Delete, target)
        };
        self.runner.run(&request).await?;
        Ok(())
    }
}

/// Registry with one command module per configured resource type.
///
/// Types without a usable command are left unregistered, so their nodes fail
/// individually with [`ProviderError::NotRegistered`].
#[must_use]
pub fn registry_from_modules(modules: &BTreeMap<ResourceType, ModuleSpec>) -> ProviderRegistry {
    ProviderRegistry::from_executors(modules.iter().filter_map(|(resource_type, spec)| {
        CommandModuleRunner::from_spec(spec).map(|runner| {
            let executor: Arc<dyn ResourceExecutor> = Arc::new(ModuleExecutor::new(runner));
            (*resource_type, executor)
        })
    }))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use strata_domain::ResourceType;

    use super::{
        CommandModuleRunner, ModuleAction, ModuleExecutor, ModuleRequest, ModuleResponse,
        ModuleRunner, registry_from_modules,
    };
    use crate::document::ModuleSpec;
    use crate::error::ProviderError;
    use crate::providers::{ResourceExecutor, Target};
    use crate::testing::node_id;

    struct EchoRunner {
        seen: Mutex<Vec<ModuleRequest>>,
        response: ModuleResponse,
    }

    #[async_trait]
    impl ModuleRunner for EchoRunner {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, request: &ModuleRequest) -> Result<ModuleResponse, ProviderError> {
            self.seen.lock().expect("lock").push(request.clone());
            Ok(self.response.clone())
        }
    }

    fn target() -> Target {
        Target {
            node: node_id("db"),
            resource_type: ResourceType::Database,
            previous_outputs: None,
        }
    }

    #[tokio::test]
    async fn executor_serializes_the_plan_for_the_module() {
        let runner = EchoRunner {
            seen: Mutex::new(Vec::new()),
            response: ModuleResponse {
                id: Some("db-1".to_string()),
                outputs: serde_json::Map::from_iter([("host".to_string(), json!("10.0.0.1"))]),
                ..ModuleResponse::default()
            },
        };
        let executor = ModuleExecutor::new(runner);
        let provisioned = executor
            .create(&target(), &json!({ "engine": "postgres" }))
            .await
            .expect("create");
        assert_eq!(provisioned.id, "db-1");
        assert_eq!(provisioned.outputs["host"], json!("10.0.0.1"));

        executor.delete(&target(), "db-1").await.expect("delete");

        let seen = executor.runner.seen.lock().expect("lock").clone();
        assert_eq!(seen[0].action, ModuleAction::Create);
        assert_eq!(seen[0].inputs, Some(json!({ "engine": "postgres" })));
        assert_eq!(seen[1].action, ModuleAction::Delete);
        assert_eq!(seen[1].provider_id.as_deref(), Some("db-1"));
    }

    #[tokio::test]
    async fn create_without_id_is_a_call_failure() {
        let executor = ModuleExecutor::new(EchoRunner {
            seen: Mutex::new(Vec::new()),
            response: ModuleResponse::default(),
        });
        let error = executor
            .create(&target(), &json!({}))
            .await
            .expect_err("no id");
        assert!(matches!(error, ProviderError::Call { operation: "create", .. }));
    }

    #[tokio::test]
    async fn missing_program_is_unavailable_not_fatal() {
        let runner = CommandModuleRunner::new("/nonexistent/strata-module", Vec::new());
        let executor = ModuleExecutor::new(runner);
        let error = executor
            .create(&target(), &json!({}))
            .await
            .expect_err("unavailable");
        assert!(matches!(error, ProviderError::Unavailable { .. }), "{error}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_runner_round_trips_json_over_stdio() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("module.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat >/dev/null\necho '{\"id\":\"x-1\",\"outputs\":{\"url\":\"https://x\"}}'\n",
        )
        .expect("write script");
        let runner = CommandModuleRunner::new("sh", vec![script.display().to_string()]);
        let provisioned = ModuleExecutor::new(runner)
            .create(&target(), &json!({ "a": 1 }))
            .await
            .expect("create");
        assert_eq!(provisioned.id, "x-1");
        assert_eq!(provisioned.outputs["url"], json!("https://x"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn module_error_field_and_exit_status_fail_the_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("module.sh");
        std::fs::write(&script, "#!/bin/sh\necho '{\"error\":\"quota exceeded\"}'\n")
            .expect("write script");
        let runner = CommandModuleRunner::new("sh", vec![script.display().to_string()]);
        let error = runner
            .run(&ModuleRequest {
                action: ModuleAction::Delete,
                resource_type: ResourceType::Bucket,
                node: None,
                inputs: None,
                provider_id: Some("b".to_string()),
                previous_outputs: None,
            })
            .await
            .expect_err("error field");
        assert_eq!(error.to_string(), "delete failed: quota exceeded");

        let failing = temp.path().join("fail.sh");
        std::fs::write(&failing, "#!/bin/sh\necho boom >&2\nexit 3\n").expect("write script");
        let runner = CommandModuleRunner::new("sh", vec![failing.display().to_string()]);
        let error = ModuleExecutor::new(runner)
            .delete(&target(), "x")
            .await
            .expect_err("exit status");
        assert_eq!(error.to_string(), "delete failed: boom");
    }

    #[test]
    fn registry_skips_modules_without_a_command() {
        let modules = BTreeMap::from([
            (
                ResourceType::Secret,
                ModuleSpec {
                    command: vec!["/usr/bin/vault-module".to_string(), "--json".to_string()],
                    env: BTreeMap::new(),
                },
            ),
            (
                ResourceType::Bucket,
                ModuleSpec {
                    command: Vec::new(),
                    env: BTreeMap::new(),
                },
            ),
        ]);
        let registry = registry_from_modules(&modules);
        let executor = registry.select(ResourceType::Secret).expect("secret module");
        assert_eq!(executor.name(), "/usr/bin/vault-module");
        assert!(matches!(
            registry.select(ResourceType::Bucket),
            Err(ProviderError::NotRegistered { .. })
        ));
    }
}
