use std::collections::{BTreeMap, BTreeSet, HashMap};

use rayon::prelude::*;
use serde_json::Value;
use sha2::{Digest, Sha256};
use strata_domain::{Change, ChangeAction, Changeset, Node, NodeId, NodeStatus, Phase};
use tracing::debug;

use crate::builder::DesiredGraph;
use crate::error::PlanningError;
use crate::expression::{ConfigValue, Context, Resolution};
use crate::graph::DependencyGraph;

type PlanResult<T> = std::result::Result<T, PlanningError>;


/// SHA-256 over the canonical JSON form of `value`.
///
/// Object keys serialize in sorted order, so equal values always hash equally.
#[must_use]
pub fn fingerprint(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// `base` plus the outputs every previously applied node published.
#[must_use]
pub fn planning_context(previous: &DependencyGraph, base: &Context) -> Context {
    let mut context = base.clone();
    for node in previous.nodes() {
        if let Some(outputs) = &node.outputs {
            context.insert(node.id.to_string(), Value::Object(outputs.clone()));
        }
    }
    context
}

struct Assessment<'a> {
    node: &'a Node,
    resolved: Option<Value>,
    fingerprint: Option<String>,
}

enum Decision {
    Create { reason: Option<String> },
    Update { reason: String, probe: bool },
    Replace { reason: String },
    NoOp,
}

/// Compute the ordered changeset taking `previous` to `desired`.
///
/// Operations come in three phases: deletes in the previous graph's teardown
/// order, then creates/updates/no-ops in the desired graph's apply order, then
/// deletes of removed nodes that a surviving node depended on, directly or
/// through other removed nodes. Every change
/// lists the earlier changes it must wait for in `depends_on`.
///
/// # Errors
///
/// Returns an error when either graph has a cycle or a desired node holds a
/// malformed reference.
pub fn diff(
    previous: &DependencyGraph,
    desired: &DesiredGraph,
    base: &Context,
) -> PlanResult<Changeset> {
    let context = planning_context(previous, base);
    let apply_order = desired.graph.topological_order()?;
    let teardown_order = previous.teardown_order()?;

    let stranded = stranded_nodes(desired);
    let mut warnings = Vec::new();
    for id in &stranded {
        let cause = desired.orphans.get(id).map_or_else(
            || "depends on a node that references a removed node".to_string(),
            |missing| {
                let names: Vec<&str> = missing.iter().map(NodeId::as_str).collect();
                format!("references removed node(s) {}", names.join(", "))
            },
        );
        let consequence = if previous.contains(id) {
            "it will be deleted"
        } else {
            "it will not be created"
        };
        warnings.push(format!("{id} {cause}; {consequence}"));
    }

    let mut assessed = apply_order
        .par_iter()
        .enumerate()
        .filter(|(_, node)| !stranded.contains(&node.id))
        .map(|(index, node)| (index, assess(node, &context)))
        .collect::<Vec<_>>();
    assessed.sort_by_key(|(index, _)| *index);
    let assessed = assessed
        .into_iter()
        .map(|(_, assessment)| assessment)
        .collect::<PlanResult<Vec<_>>>()?;

    let decisions: Vec<(Assessment<'_>, Decision)> = assessed
        .into_iter()
        .map(|assessment| {
            let decision = decide(previous.node(&assessment.node.id), &assessment);
            (assessment, decision)
        })
        .collect();

    let replaced: BTreeSet<&NodeId> = decisions
        .iter()
        .filter(|(_, decision)| matches!(decision, Decision::Replace { .. }))
        .map(|(assessment, _)| &assessment.node.id)
        .collect();
    let removed: BTreeSet<&NodeId> = previous
        .nodes()
        .filter(|node| !desired.graph.contains(&node.id) || stranded.contains(&node.id))
        .map(|node| &node.id)
        .collect();
    let survives = |id: &NodeId| {
        desired.graph.contains(id) && !stranded.contains(id) && !replaced.contains(id)
    };
    let deferred = deferred_deletes(previous, &removed, &replaced, survives);

    let mut operations: Vec<Change> = Vec::new();
    let mut teardown_index: HashMap<&NodeId, usize> = HashMap::new();
    let mut apply_index: HashMap<&NodeId, usize> = HashMap::new();
    let mut cleanup_index: HashMap<&NodeId, usize> = HashMap::new();

    for node in &teardown_order {
        let id = &node.id;
        if deferred.contains(id) || !(removed.contains(id) || replaced.contains(id)) {
            continue;
        }
        let depends_on = indices(previous.dependents(id), &teardown_index);
        let reason = if replaced.contains(id) {
            "replaced"
        } else {
            "removed from configuration"
        };
        teardown_index.insert(id, operations.len());
        operations.push(delete_change(node, Phase::Teardown, reason, replaced.contains(id), depends_on));
    }

    for (assessment, decision) in &decisions {
        let id = &assessment.node.id;
        let mut depends_on = indices(desired.graph.dependencies(id), &apply_index);
        let prior = previous.node(id);
        let change = match decision {
            Decision::Create { reason } => Change {
                reason: reason.clone(),
                ..apply_change(assessment, ChangeAction::Create, None, false)
            },
            Decision::Update { reason, probe } => Change {
                reason: Some(reason.clone()),
                ..apply_change(
                    assessment,
                    ChangeAction::Update,
                    prior.and_then(|node| node.provider_id.clone()),
                    *probe,
                )
            },
            Decision::Replace { reason } => {
                if let Some(delete) = teardown_index.get(id) {
                    depends_on.push(*delete);
                    depends_on.sort_unstable();
                }
                Change {
                    reason: Some(reason.clone()),
                    replacement: true,
                    ..apply_change(assessment, ChangeAction::Create, None, false)
                }
            }
            Decision::NoOp => apply_change(
                assessment,
                ChangeAction::NoOp,
                prior.and_then(|node| node.provider_id.clone()),
                false,
            ),
        };
        apply_index.insert(id, operations.len());
        operations.push(Change { depends_on, ..change });
    }

    for node in &teardown_order {
        let id = &node.id;
        if !deferred.contains(id) {
            continue;
        }
        let mut depends_on = indices(previous.dependents(id), &teardown_index);
        depends_on.extend(indices(previous.dependents(id), &apply_index));
        depends_on.extend(indices(previous.dependents(id), &cleanup_index));
        depends_on.sort_unstable();
        cleanup_index.insert(id, operations.len());
        operations.push(delete_change(
            node,
            Phase::Cleanup,
            "removed from configuration; deleted after dependents moved off",
            false,
            depends_on,
        ));
    }

    debug!(operations = operations.len(), warnings = warnings.len(), "changeset computed");
    Ok(Changeset {
        operations,
        warnings,
    })
}

/// Removed nodes whose delete waits for the cleanup phase.
///
/// A removed node is deferred while a surviving node still depends on it, and
/// so is every removed node a deferred one depends on. Nodes depending on a
/// replaced node are never deferred: the old instance of a replaced node is
/// deleted in teardown, so its dependents have to go first.
fn deferred_deletes<'a>(
    previous: &'a DependencyGraph,
    removed: &BTreeSet<&'a NodeId>,
    replaced: &BTreeSet<&NodeId>,
    survives: impl Fn(&NodeId) -> bool,
) -> BTreeSet<&'a NodeId> {
    let pinned: BTreeSet<&NodeId> = replaced
        .iter()
        .flat_map(|id| previous.transitive_dependents(id.as_str()))
        .collect();

    let mut deferred = BTreeSet::new();
    let mut stack: Vec<&NodeId> = removed
        .iter()
        .copied()
        .filter(|id| !pinned.contains(id))
        .filter(|id| {
            previous
                .dependents(id.as_str())
                .into_iter()
                .any(|dependent| survives(dependent))
        })
        .collect();
    while let Some(id) = stack.pop() {
        if !deferred.insert(id) {
            continue;
        }
        stack.extend(
            previous
                .dependencies(id.as_str())
                .into_iter()
                .filter(|dependency| removed.contains(dependency) && !pinned.contains(dependency)),
        );
    }
    deferred
}

/// Orphans plus every desired node depending on one, directly or transitively.
fn stranded_nodes(desired: &DesiredGraph) -> BTreeSet<NodeId> {
    let mut stranded = BTreeSet::new();
    for orphan in desired.orphans.keys() {
        stranded.insert(orphan.clone());
        stranded.extend(
            desired
                .graph
                .transitive_dependents(orphan)
                .into_iter()
                .cloned(),
        );
    }
    stranded
}

fn indices(ids: Vec<&NodeId>, positions: &HashMap<&NodeId, usize>) -> Vec<usize> {
    let mut found: Vec<usize> = ids
        .into_iter()
        .filter_map(|id| positions.get(id).copied())
        .collect();
    found.sort_unstable();
    found
}

fn assess<'a>(node: &'a Node, context: &Context) -> PlanResult<Assessment<'a>> {
    let parsed =
        ConfigValue::parse(&node.inputs, "inputs").map_err(|source| PlanningError::Expression {
            node: node.id.clone(),
            source,
        })?;
    let resolved = match parsed.resolve(context) {
        Resolution::Resolved(value) => Some(value),
        Resolution::Pending(_) => None,
    };
    let fingerprint = resolved.as_ref().map(fingerprint);
    Ok(Assessment {
        node,
        resolved,
        fingerprint,
    })
}

fn decide(previous: Option<&Node>, assessment: &Assessment<'_>) -> Decision {
    let Some(previous) = previous else {
        return Decision::Create { reason: None };
    };
    let node = assessment.node;

    let probe = previous.status == NodeStatus::Unknown || previous.status.is_in_flight();
    if !previous.is_provisioned() && !previous.status.is_success() && !probe {
        return Decision::Create {
            reason: Some(format!(
                "previous create did not complete (status {})",
                previous.status
            )),
        };
    }

    if previous.resource_type != node.resource_type {
        return Decision::Replace {
            reason: format!(
                "resource type changed from {} to {}",
                previous.resource_type, node.resource_type
            ),
        };
    }

    let changed = changed_fields(previous, assessment);
    let schema = node.resource_type.schema();
    let forcing: Vec<&str> = changed
        .iter()
        .map(String::as_str)
        .filter(|field| schema.forces_replacement(field))
        .collect();
    if !forcing.is_empty() {
        return Decision::Replace {
            reason: format!("{} cannot change in place", forcing.join(", ")),
        };
    }

    if !changed.is_empty() {
        return Decision::Update {
            reason: format!("{} changed", changed.join(", ")),
            probe,
        };
    }
    if assessment.fingerprint.is_none() {
        return Decision::Update {
            reason: "inputs depend on outputs not yet available".to_string(),
            probe,
        };
    }
    if assessment.fingerprint != previous.fingerprint {
        return Decision::Update {
            reason: "inputs changed".to_string(),
            probe,
        };
    }
    if matches!(previous.status, NodeStatus::Error | NodeStatus::Pending) {
        return Decision::Update {
            reason: format!("retrying after previous status {}", previous.status),
            probe,
        };
    }
    if probe {
        return Decision::Update {
            reason: format!("previous status {} must be verified", previous.status),
            probe,
        };
    }
    Decision::NoOp
}

/// Top-level input fields whose value differs, compared on resolved inputs
/// when both sides have them and on raw inputs otherwise.
fn changed_fields(previous: &Node, assessment: &Assessment<'_>) -> Vec<String> {
    let (before, after) = match (&previous.resolved_inputs, &assessment.resolved) {
        (Some(before), Some(after)) => (before, after),
        _ => (&previous.inputs, &assessment.node.inputs),
    };
    let empty = serde_json::Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    let mut fields: BTreeMap<&str, ()> = BTreeMap::new();
    for (key, value) in before {
        if after.get(key) != Some(value) {
            fields.insert(key, ());
        }
    }
    for (key, value) in after {
        if before.get(key) != Some(value) {
            fields.insert(key, ());
        }
    }
    fields.into_keys().map(str::to_string).collect()
}

fn apply_change(
    assessment: &Assessment<'_>,
    action: ChangeAction,
    provider_id: Option<String>,
    probe: bool,
) -> Change {
    let node = assessment.node;
    Change {
        node: node.id.clone(),
        resource_type: node.resource_type,
        action,
        phase: Phase::Apply,
        replacement: false,
        reason: None,
        inputs: node.inputs.clone(),
        resolved_inputs: assessment.resolved.clone(),
        fingerprint: assessment.fingerprint.clone(),
        provider_id,
        probe,
        depends_on: Vec::new(),
    }
}

fn delete_change(
    node: &Node,
    phase: Phase,
    reason: &str,
    replacement: bool,
    depends_on: Vec<usize>,
) -> Change {
    let probe = node.status == NodeStatus::Unknown || node.status.is_in_flight();
    let reason = if node.provider_id.is_none() && !probe {
        format!("{reason}; never provisioned")
    } else {
        reason.to_string()
    };
    Change {
        node: node.id.clone(),
        resource_type: node.resource_type,
        action: ChangeAction::Delete,
        phase,
        replacement,
        reason: Some(reason),
        inputs: node
            .resolved_inputs
            .clone()
            .unwrap_or_else(|| node.inputs.clone()),
        resolved_inputs: node.resolved_inputs.clone(),
        fingerprint: node.fingerprint.clone(),
        provider_id: node.provider_id.clone(),
        probe,
        depends_on,
    }
}
