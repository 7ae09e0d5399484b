#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use strata_domain::{Edge, Node, NodeId, NodeStatus, Outputs, ResourceType};

use crate::builder::{DesiredGraph, build_graph};
use crate::document::{Configuration, ResourceDeclaration};
use crate::error::ProviderError;
use crate::expression::{ConfigValue, Context};
use crate::graph::DependencyGraph;
use crate::plan::fingerprint;
use crate::providers::{ListFilter, Observed, Provisioned, ResourceExecutor, Target};

pub(crate) fn node_id(name: &str) -> NodeId {
    NodeId::try_from(name).expect("node id")
}

pub(crate) fn declare(name: &str, resource_type: ResourceType, inputs: Value) -> ResourceDeclaration {
    ResourceDeclaration {
        name: node_id(name),
        resource_type,
        inputs,
        depends_on: Vec::new(),
        source: PathBuf::from("main.yml"),
    }
}

pub(crate) fn configuration(resources: Vec<ResourceDeclaration>) -> Configuration {
    let mut configuration = Configuration::default();
    configuration.resources = resources;
    configuration
}

pub(crate) fn desired(resources: Vec<ResourceDeclaration>) -> DesiredGraph {
    build_graph(&configuration(resources), None).expect("build desired graph")
}

pub(crate) fn desired_after(
    resources: Vec<ResourceDeclaration>,
    previous: &DependencyGraph,
) -> DesiredGraph {
    build_graph(&configuration(resources), Some(previous)).expect("build desired graph")
}

/// A graph of complete, provisioned nodes with empty inputs.
pub(crate) fn previous_graph(
    nodes: &[(&str, ResourceType)],
    edges: &[(&str, &str)],
) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for (name, resource_type) in nodes {
        let mut node = Node::new(node_id(name), *resource_type, json!({}));
        node.resolved_inputs = Some(json!({}));
        node.fingerprint = Some(fingerprint(&json!({})));
        node.outputs = Some(serde_json::Map::from_iter([(
            "id".to_string(),
            json!(format!("id-{name}")),
        )]));
        node.provider_id = Some(format!("id-{name}"));
        node.status = NodeStatus::Complete;
        graph.insert_node(node).expect("insert node");
    }
    for (from, to) in edges {
        graph
            .insert_edge(Edge::new(node_id(from), node_id(to)))
            .expect("insert edge");
    }
    graph
}

/// What the state would look like after `desired` applied successfully with
/// each node publishing `outputs[name]` (or `{ "id": "id-<name>" }`).
pub(crate) fn applied(desired: &DependencyGraph, outputs: &[(&str, Value)]) -> DependencyGraph {
    let published: BTreeMap<&str, &Value> = outputs.iter().map(|(name, value)| (*name, value)).collect();
    let mut context = Context::new();
    let mut graph = desired.clone();
    let order: Vec<NodeId> = desired
        .topological_order()
        .expect("acyclic")
        .into_iter()
        .map(|node| node.id.clone())
        .collect();
    for id in order {
        let node = graph.node_mut(&id).expect("node");
        let resolved = ConfigValue::parse(&node.inputs, "inputs")
            .expect("parse")
            .resolve(&context)
            .into_value()
            .expect("resolvable in apply order");
        let output = published
            .get(id.as_str())
            .map_or_else(|| json!({ "id": format!("id-{id}") }), |value| (*value).clone());
        node.fingerprint = Some(fingerprint(&resolved));
        node.resolved_inputs = Some(resolved);
        node.outputs = output.as_object().cloned();
        node.provider_id = Some(format!("id-{id}"));
        node.status = NodeStatus::Created;
        context.insert(id.to_string(), output);
    }
    graph
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub operation: &'static str,
    pub node: String,
    pub inputs: Option<Value>,
}

/// In-memory executor whose results are scripted per node.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    name: String,
    outputs: BTreeMap<String, Value>,
    failures: BTreeMap<(String, &'static str), String>,
    delays: BTreeMap<String, Duration>,
    existing: Mutex<BTreeMap<String, Observed>>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub(crate) fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn with_outputs(mut self, node: &str, outputs: Value) -> Self {
        self.outputs.insert(node.to_string(), outputs);
        self
    }

    pub(crate) fn failing(mut self, node: &str, operation: &'static str, message: &str) -> Self {
        self.failures
            .insert((node.to_string(), operation), message.to_string());
        self
    }

    pub(crate) fn slow(mut self, node: &str, delay: Duration) -> Self {
        self.delays.insert(node.to_string(), delay);
        self
    }

    pub(crate) fn with_existing(self, observed: Observed) -> Self {
        self.existing
            .lock()
            .expect("existing lock")
            .insert(observed.id.clone(), observed);
        self
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn operations(&self) -> Vec<(String, &'static str)> {
        self.calls()
            .into_iter()
            .map(|call| (call.node, call.operation))
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(
        &self,
        operation: &'static str,
        node: &str,
        inputs: Option<&Value>,
    ) -> Result<(), ProviderError> {
        self.calls.lock().expect("calls lock").push(RecordedCall {
            operation,
            node: node.to_string(),
            inputs: inputs.cloned(),
        });
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(node) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.failures.get(&(node.to_string(), operation)) {
            Some(message) => Err(ProviderError::Call {
                operation,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn outputs_for(&self, node: &str) -> Outputs {
        self.outputs
            .get(node)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(|| {
                serde_json::Map::from_iter([("id".to_string(), json!(format!("id-{node}")))])
            })
    }
}

#[async_trait]
impl ResourceExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, target: &Target, id: &str) -> Result<Option<Observed>, ProviderError> {
        self.enter("get", target.node.as_str(), None).await?;
        Ok(self.existing.lock().expect("existing lock").get(id).cloned())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Observed>, ProviderError> {
        let node = filter.node.as_ref().map_or("", NodeId::as_str);
        self.enter("list", node, None).await?;
        Ok(self
            .existing
            .lock()
            .expect("existing lock")
            .values()
            .filter(|observed| filter.node.is_none() || observed.node == filter.node)
            .cloned()
            .collect())
    }

    async fn create(&self, target: &Target, inputs: &Value) -> Result<Provisioned, ProviderError> {
        let node = target.node.as_str();
        self.enter("create", node, Some(inputs)).await?;
        let id = format!("id-{node}");
        let outputs = self.outputs_for(node);
        self.existing.lock().expect("existing lock").insert(
            id.clone(),
            Observed {
                id: id.clone(),
                node: Some(target.node.clone()),
                outputs: outputs.clone(),
                status: NodeStatus::Complete,
            },
        );
        Ok(Provisioned { id, outputs })
    }

    async fn update(
        &self,
        target: &Target,
        _id: &str,
        inputs: &Value,
    ) -> Result<Outputs, ProviderError> {
        let node = target.node.as_str();
        self.enter("update", node, Some(inputs)).await?;
        Ok(self.outputs_for(node))
    }

    async fn delete(&self, target: &Target, id: &str) -> Result<(), ProviderError> {
        self.enter("delete", target.node.as_str(), None).await?;
        self.existing.lock().expect("existing lock").remove(id);
        Ok(())
    }
}
