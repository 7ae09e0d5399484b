use std::collections::BTreeMap;

use serde_json::Value;
use strata_domain::{Edge, EnvironmentName, Node, NodeId};
use tracing::debug;

use crate::document::{Configuration, ResourceDeclaration};
use crate::error::BuildError;
use crate::expression::{ConfigValue, Context};
use crate::graph::DependencyGraph;

/// Reference roots that never name a node.
pub const STATIC_ROOTS: [&str; 2] = ["vars", "environment"];

/// Result of building the desired graph.
#[derive(Debug, Clone, Default)]
pub struct DesiredGraph {
    pub graph: DependencyGraph,
    /// Desired nodes referencing nodes that only exist in the previous graph,
    /// mapped to those missing roots.
    pub orphans: BTreeMap<NodeId, Vec<NodeId>>,
}

/// Turn a configuration into a graph of nodes and "depends-on" edges.
///
/// When `previous` is given, a reference to a node that exists only there is
/// recorded as an orphan instead of failing the build.
///
/// # Errors
///
/// Returns an error for malformed references, references to unknown roots,
/// missing required inputs, unknown explicit dependencies, self references
/// and dependency cycles.
pub fn build_graph(
    configuration: &Configuration,
    previous: Option<&DependencyGraph>,
) -> std::result::Result<DesiredGraph, BuildError> {
    let mut graph = DependencyGraph::new();
    for resource in &configuration.resources {
        check_required_inputs(resource)?;
        graph.insert_node(Node::new(
            resource.name.clone(),
            resource.resource_type,
            resource.inputs.clone(),
        ))?;
    }

    let mut orphans: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for resource in &configuration.resources {
        let parsed = ConfigValue::parse(&resource.inputs, "inputs").map_err(|source| {
            BuildError::Expression {
                node: resource.name.clone(),
                source,
            }
        })?;

        for reference in parsed.references() {
            let root = reference.root();
            if graph.contains(root) {
                let Ok(target) = NodeId::try_from(root) else {
                    continue;
                };
                debug!(node = %resource.name, dependency = %target, path = %reference, "reference edge");
                graph.insert_edge(Edge::new(resource.name.clone(), target))?;
            } else if STATIC_ROOTS.contains(&root) {
                continue;
            } else if let Some(removed) = previous.and_then(|previous| previous.node(root)) {
                let missing = orphans.entry(resource.name.clone()).or_default();
                if !missing.contains(&removed.id) {
                    missing.push(removed.id.clone());
                }
            } else {
                return Err(BuildError::UnknownReference {
                    node: resource.name.clone(),
                    root: root.to_string(),
                    reference: reference.raw().to_string(),
                });
            }
        }

        for dependency in &resource.depends_on {
            if !graph.contains(dependency) {
                return Err(BuildError::UnknownDependency {
                    node: resource.name.clone(),
                    dependency: dependency.clone(),
                });
            }
            graph.insert_edge(Edge::new(resource.name.clone(), dependency.clone()))?;
        }
    }

    graph.topological_order()?;
    Ok(DesiredGraph { graph, orphans })
}

fn check_required_inputs(resource: &ResourceDeclaration) -> std::result::Result<(), BuildError> {
    let schema = resource.resource_type.schema();
    for &input in schema.required_inputs {
        let present = resource
            .inputs
            .get(input)
            .is_some_and(|value| !value.is_null());
        if !present {
            return Err(BuildError::MissingInput {
                node: resource.name.clone(),
                resource_type: resource.resource_type,
                input,
            });
        }
    }
    Ok(())
}

/// Context holding the static roots: `vars` and `environment`.
#[must_use]
pub fn static_context(configuration: &Configuration, environment: &EnvironmentName) -> Context {
    let mut context = Context::new();
    context.insert(
        "vars",
        Value::Object(configuration.vars.clone().into_iter().collect()),
    );
    context.insert("environment", Value::String(environment.to_string()));
    context
}
