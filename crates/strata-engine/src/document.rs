use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use strata_domain::{EnvironmentName, NodeId, ResourceType};

use crate::apply::EngineOptions;
use crate::error::DocumentError;

type DocumentResult<T> = std::result::Result<T, DocumentError>;

/// External program provisioning one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    /// Program and arguments; the first element is the executable.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One declared resource after version-specific normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDeclaration {
    pub name: NodeId,
    pub resource_type: ResourceType,
    pub inputs: Value,
    /// Ordering edges that do not come from a reference.
    pub depends_on: Vec<NodeId>,
    pub source: PathBuf,
}

/// Merged view over every configuration document of one source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Configuration {
    pub environment: Option<EnvironmentName>,
    pub vars: BTreeMap<String, Value>,
    pub providers: BTreeMap<ResourceType, ModuleSpec>,
    pub settings: Option<EngineOptions>,
    settings_source: Option<PathBuf>,
    pub resources: Vec<ResourceDeclaration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DocumentV1 {
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    vars: BTreeMap<String, Value>,
    #[serde(default)]
    providers: BTreeMap<String, ModuleSpec>,
    #[serde(default)]
    settings: Option<EngineOptions>,
    #[serde(default)]
    resources: BTreeMap<String, ResourceV1>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceV1 {
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default = "empty_inputs")]
    inputs: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DocumentV2 {
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    vars: BTreeMap<String, Value>,
    #[serde(default)]
    providers: BTreeMap<String, ModuleSpec>,
    #[serde(default)]
    settings: Option<EngineOptions>,
    #[serde(default)]
    resources: Vec<ResourceV2>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceV2 {
    name: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default = "empty_inputs")]
    inputs: Value,
    #[serde(default)]
    depends_on: Vec<String>,
}

fn empty_inputs() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Read and parse one configuration document.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn load_document(path: &Path) -> DocumentResult<Configuration> {
    let text = fs::read_to_string(path).map_err(|source| DocumentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_document(path, &text)
}

/// Parse a YAML or JSON document, dispatching on its `version` field.
///
/// # Errors
///
/// Returns an error for malformed documents, unknown versions, invalid names
/// and unknown resource types.
pub fn parse_document(path: &Path, text: &str) -> DocumentResult<Configuration> {
    let parse_error = |source| DocumentError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let mut raw: serde_yaml::Mapping = serde_yaml::from_str(text).map_err(parse_error)?;
    let version = match raw.remove("version") {
        Some(serde_yaml::Value::String(version)) => version,
        Some(other) => format!("{other:?}"),
        None => String::new(),
    };

    match version.as_str() {
        "v1" => {
            let document: DocumentV1 =
                serde_yaml::from_value(serde_yaml::Value::Mapping(raw)).map_err(parse_error)?;
            let resources = document
                .resources
                .into_iter()
                .map(|(name, resource)| {
                    declaration(path, name, &resource.resource_type, resource.inputs, Vec::new())
                })
                .collect::<DocumentResult<Vec<_>>>()?;
            normalize(
                path,
                document.environment,
                document.vars,
                document.providers,
                document.settings,
                resources,
            )
        }
        "v2" => {
            let document: DocumentV2 =
                serde_yaml::from_value(serde_yaml::Value::Mapping(raw)).map_err(parse_error)?;
            let resources = document
                .resources
                .into_iter()
                .map(|resource| {
                    declaration(
                        path,
                        resource.name,
                        &resource.resource_type,
                        resource.inputs,
                        resource.depends_on,
                    )
                })
                .collect::<DocumentResult<Vec<_>>>()?;
            let mut configuration = normalize(
                path,
                document.environment,
                document.vars,
                document.providers,
                document.settings,
                Vec::new(),
            )?;
            for resource in resources {
                configuration.push_resource(resource)?;
            }
            Ok(configuration)
        }
        _ => Err(DocumentError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        }),
    }
}

fn declaration(
    path: &Path,
    name: String,
    resource_type: &str,
    inputs: Value,
    depends_on: Vec<String>,
) -> DocumentResult<ResourceDeclaration> {
    let invalid = |source| DocumentError::Invalid {
        path: path.to_path_buf(),
        source,
    };
    Ok(ResourceDeclaration {
        name: NodeId::new(name).map_err(invalid)?,
        resource_type: resource_type.parse().map_err(invalid)?,
        inputs,
        depends_on: depends_on
            .into_iter()
            .map(NodeId::new)
            .collect::<Result<_, _>>()
            .map_err(invalid)?,
        source: path.to_path_buf(),
    })
}

fn normalize(
    path: &Path,
    environment: Option<String>,
    vars: BTreeMap<String, Value>,
    providers: BTreeMap<String, ModuleSpec>,
    settings: Option<EngineOptions>,
    resources: Vec<ResourceDeclaration>,
) -> DocumentResult<Configuration> {
    let invalid = |source| DocumentError::Invalid {
        path: path.to_path_buf(),
        source,
    };
    let environment = environment
        .map(EnvironmentName::new)
        .transpose()
        .map_err(invalid)?;
    let providers = providers
        .into_iter()
        .map(
            |(name, module)| -> DocumentResult<(ResourceType, ModuleSpec)> {
                Ok((name.parse().map_err(invalid)?, module))
            },
        )
        .collect::<DocumentResult<BTreeMap<_, _>>>()?;
    let settings_source = settings.as_ref().map(|_| path.to_path_buf());

    Ok(Configuration {
        environment,
        vars,
        providers,
        settings,
        settings_source,
        resources,
    })
}

impl Configuration {
    fn push_resource(&mut self, resource: ResourceDeclaration) -> DocumentResult<()> {
        if let Some(existing) = self
            .resources
            .iter()
            .find(|existing| existing.name == resource.name)
        {
            return Err(DocumentError::DuplicateResource {
                name: resource.name.to_string(),
                first: existing.source.clone(),
                second: resource.source,
            });
        }
        self.resources.push(resource);
        Ok(())
    }

    /// Fold `other` into `self`.
    ///
    /// # Errors
    ///
    /// Returns an error when both documents declare the same resource, provider
    /// or settings block, or disagree on the environment or a variable.
    pub fn merge(&mut self, other: Self) -> DocumentResult<()> {
        match (&self.environment, other.environment) {
            (Some(first), Some(second)) if *first != second => {
                return Err(DocumentError::ConflictingEnvironment {
                    first: first.to_string(),
                    second: second.to_string(),
                });
            }
            (None, Some(second)) => self.environment = Some(second),
            _ => {}
        }

        for (key, value) in other.vars {
            match self.vars.get(&key) {
                Some(existing) if *existing != value => {
                    return Err(DocumentError::ConflictingVar { key });
                }
                _ => {
                    self.vars.insert(key, value);
                }
            }
        }

        for (resource_type, module) in other.providers {
            if self.providers.contains_key(&resource_type) {
                return Err(DocumentError::DuplicateProvider { resource_type });
            }
            self.providers.insert(resource_type, module);
        }

        if let Some(settings) = other.settings {
            if let Some(first) = &self.settings_source {
                return Err(DocumentError::DuplicateSettings {
                    first: first.clone(),
                    second: other.settings_source.unwrap_or_default(),
                });
            }
            self.settings = Some(settings);
            self.settings_source = other.settings_source;
        }

        for resource in other.resources {
            self.push_resource(resource)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceDeclaration> {
        self.resources
            .iter()
            .find(|resource| resource.name.as_str() == name)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::path::Path;

    use serde_json::json;
    use strata_domain::ResourceType;

    use super::parse_document;
    use crate::error::DocumentError;

    const V1: &str = r#"
version: v1
environment: staging
vars:
  region: eu-west-1
providers:
  database:
    command: ["./modules/db.sh", "--fast"]
settings:
  concurrency: 2
  timeouts:
    create: 30
resources:
  db:
    type: database
    inputs:
      engine: postgres
      version: "16"
  app:
    type: deployment
    inputs:
      image: app:1
      url: "${{ db.host }}"
"#;

    #[test]
    fn parses_v1_map_of_resources() {
        let configuration = parse_document(Path::new("main.yml"), V1).expect("parse");
        assert_eq!(
            configuration.environment.as_ref().map(ToString::to_string),
            Some("staging".to_string())
        );
        assert_eq!(configuration.vars["region"], json!("eu-west-1"));
        assert_eq!(
            configuration.providers[&ResourceType::Database].command,
            vec!["./modules/db.sh", "--fast"]
        );
        let settings = configuration.settings.expect("settings");
        assert_eq!(settings.concurrency, 2);
        assert_eq!(settings.timeouts.create, 30);
        assert_eq!(settings.timeouts.delete, 600, "unset timeouts keep defaults");

        let names: Vec<&str> = configuration
            .resources
            .iter()
            .map(|resource| resource.name.as_str())
            .collect();
        assert_eq!(names, vec!["app", "db"]);
        let app = configuration.resource("app").expect("app");
        assert_eq!(app.resource_type, ResourceType::Deployment);
        assert_eq!(app.inputs["url"], json!("${{ db.host }}"));
    }

    #[test]
    fn parses_v2_list_with_explicit_dependencies() {
        let text = r#"{
            "version": "v2",
            "resources": [
                { "name": "cluster", "type": "kubernetes_cluster", "inputs": { "region": "x", "version": "1.30" } },
                { "name": "ns", "type": "namespace", "inputs": { "name": "apps" }, "depends_on": ["cluster"] }
            ]
        }"#;
        let configuration = parse_document(Path::new("main.json"), text).expect("parse");
        let namespace = configuration.resource("ns").expect("ns");
        assert_eq!(namespace.depends_on.len(), 1);
        assert_eq!(namespace.depends_on[0].as_str(), "cluster");
    }

    #[test]
    fn rejects_unknown_versions_and_types() {
        let error = parse_document(Path::new("a.yml"), "version: v9\n").expect_err("version");
        assert!(matches!(error, DocumentError::UnsupportedVersion { .. }));

        let error = parse_document(Path::new("a.yml"), "resources: {}\n").expect_err("missing");
        assert!(matches!(error, DocumentError::UnsupportedVersion { .. }));

        let text = "version: v1\nresources:\n  x:\n    type: mainframe\n";
        let error = parse_document(Path::new("a.yml"), text).expect_err("type");
        assert!(error.to_string().contains("mainframe"), "{error}");
    }

    #[test]
    fn rejects_duplicate_names_in_one_v2_document() {
        let text = "version: v2\nresources:\n  - { name: a, type: secret }\n  - { name: a, type: secret }\n";
        let error = parse_document(Path::new("a.yml"), text).expect_err("duplicate");
        assert!(matches!(error, DocumentError::DuplicateResource { .. }));
    }

    #[test]
    fn merge_detects_conflicts() {
        let mut first = parse_document(
            Path::new("a.yml"),
            "version: v1\nenvironment: prod\nresources:\n  a: { type: secret }\n",
        )
        .expect("first");
        let second = parse_document(
            Path::new("b.yml"),
            "version: v1\nresources:\n  a: { type: secret }\n",
        )
        .expect("second");
        let error = first.merge(second).expect_err("duplicate resource");
        assert!(error.to_string().contains("a.yml"), "{error}");

        let third = parse_document(Path::new("c.yml"), "version: v2\nenvironment: dev\n")
            .expect("third");
        let error = first.merge(third).expect_err("environment");
        assert!(matches!(error, DocumentError::ConflictingEnvironment { .. }));
    }
}
