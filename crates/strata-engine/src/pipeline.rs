use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;
use strata_domain::{Changeset, EnvironmentName, Node, RunReport};
use tracing::info;

use crate::apply::{EngineOptions, Reconciler, Reconciliation};
use crate::builder::{DesiredGraph, build_graph, static_context};
use crate::discovery::discover_documents;
use crate::document::{Configuration, load_document};
use crate::error::PipelineError;
use crate::expression::Context;
use crate::graph::DependencyGraph;
use crate::module::registry_from_modules;
use crate::plan::diff;
use crate::providers::ProviderRegistry;
use crate::state::{Snapshot, StateStore};

type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Everything needed to show or execute one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Plan {
    pub environment: EnvironmentName,
    pub configuration: Configuration,
    pub desired: DesiredGraph,
    pub previous: DependencyGraph,
    pub snapshot: Option<Snapshot>,
    pub context: Context,
    pub changeset: Changeset,
    /// Values of secret nodes, to be redacted from rendered output.
    pub sensitive_values: BTreeSet<String>,
}

impl Plan {
    /// Engine options declared in configuration, or the defaults.
    #[must_use]
    pub fn options(&self) -> EngineOptions {
        self.configuration.settings.unwrap_or_default()
    }

    /// Command modules declared in configuration.
    #[must_use]
    pub fn registry(&self) -> ProviderRegistry {
        registry_from_modules(&self.configuration.providers)
    }
}

/// Result of executing a [`Plan`].
#[derive(Debug, Clone)]
pub struct Outcome {
    pub report: RunReport,
    pub snapshot: Snapshot,
    pub sensitive_values: BTreeSet<String>,
}

/// Discover and merge every configuration document under `source`.
///
/// # Errors
///
/// Returns an error when discovery finds nothing or a document is invalid or
/// conflicts with another one.
pub fn load_configuration(source: &Path) -> PipelineResult<Configuration> {
    let mut configuration = Configuration::default();
    for path in discover_documents(source)? {
        configuration.merge(load_document(&path)?)?;
    }
    Ok(configuration)
}

/// Plan the changes that take the persisted state to `source`'s configuration.
///
/// # Errors
///
/// Returns an error for invalid configuration, unreadable state, or a graph
/// that cannot be ordered. Nothing has been mutated when this fails.
pub async fn plan(source: &Path, store: &dyn StateStore) -> PipelineResult<Plan> {
    let configuration = load_configuration(source)?;
    let (environment, snapshot, previous) = load_previous(&configuration, store).await?;
    let desired = build_graph(&configuration, Some(&previous))?;
    finish_plan(configuration, environment, snapshot, previous, desired)
}

/// Plan the deletion of every node in the persisted state.
///
/// # Errors
///
/// Returns an error for invalid configuration or unreadable state.
pub async fn plan_destroy(source: &Path, store: &dyn StateStore) -> PipelineResult<Plan> {
    let configuration = load_configuration(source)?;
    let (environment, snapshot, previous) = load_previous(&configuration, store).await?;
    finish_plan(
        configuration,
        environment,
        snapshot,
        previous,
        DesiredGraph::default(),
    )
}

/// Execute `plan` and persist the resulting graph as the next snapshot.
///
/// The snapshot is written even when nodes failed, so a rerun retries only
/// what did not converge.
///
/// # Errors
///
/// Returns an error when the engine itself fails or the snapshot cannot be written.
pub async fn execute(
    plan: Plan,
    reconciler: &Reconciler,
    store: &dyn StateStore,
) -> PipelineResult<Outcome> {
    let Reconciliation { report, state } = reconciler
        .reconcile(
            plan.environment.clone(),
            plan.changeset.clone(),
            &plan.previous,
            &plan.desired.graph,
            &plan.context,
        )
        .await?;

    let snapshot = Snapshot::next(plan.snapshot.as_ref(), plan.environment.clone(), &state);
    store.save(&snapshot).await?;
    info!(
        environment = %snapshot.environment,
        serial = snapshot.serial,
        nodes = snapshot.nodes.len(),
        "state persisted"
    );

    let mut sensitive_values = plan.sensitive_values;
    sensitive_values.extend(sensitive_values_of(state.nodes()));
    Ok(Outcome {
        report,
        snapshot,
        sensitive_values,
    })
}

async fn load_previous(
    configuration: &Configuration,
    store: &dyn StateStore,
) -> PipelineResult<(EnvironmentName, Option<Snapshot>, DependencyGraph)> {
    let environment = configuration.environment.clone().unwrap_or_default();
    let snapshot = store.load(&environment).await?;
    let previous = match &snapshot {
        Some(snapshot) => snapshot.to_graph()?,
        None => DependencyGraph::new(),
    };
    Ok((environment, snapshot, previous))
}

fn finish_plan(
    configuration: Configuration,
    environment: EnvironmentName,
    snapshot: Option<Snapshot>,
    previous: DependencyGraph,
    desired: DesiredGraph,
) -> PipelineResult<Plan> {
    let context = static_context(&configuration, &environment);
    let changeset = diff(&previous, &desired, &context)?;
    let summary = changeset.summary();
    info!(
        environment = %environment,
        create = summary.create,
        update = summary.update,
        delete = summary.delete,
        unchanged = summary.no_op,
        "plan computed"
    );

    let mut sensitive_values = sensitive_values_of(previous.nodes());
    sensitive_values.extend(sensitive_values_of(desired.graph.nodes()));
    Ok(Plan {
        environment,
        configuration,
        desired,
        previous,
        snapshot,
        context,
        changeset,
        sensitive_values,
    })
}

/// Every string held by a secret node: inputs, resolved inputs and outputs.
#[must_use]
pub fn sensitive_values_of<'a>(nodes: impl Iterator<Item = &'a Node>) -> BTreeSet<String> {
    let mut values = BTreeSet::new();
    for node in nodes.filter(|node| node.resource_type.is_sensitive()) {
        collect_strings(&node.inputs, &mut values);
        if let Some(resolved) = &node.resolved_inputs {
            collect_strings(resolved, &mut values);
        }
        if let Some(outputs) = &node.outputs {
            for value in outputs.values() {
                collect_strings(value, &mut values);
            }
        }
    }
    values
}

fn collect_strings(value: &Value, values: &mut BTreeSet<String>) {
    match value {
        Value::String(text) if !text.contains("${{") => {
            values.insert(text.clone());
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, values);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, values);
            }
        }
        _ => {}
    }
}
