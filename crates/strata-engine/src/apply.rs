use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_domain::{
    Change, ChangeAction, Changeset, Edge, EnvironmentName, Node, NodeId, NodeOutcome, NodeResult,
    NodeStatus, Outputs, Phase, RunReport,
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ProviderError};
use crate::expression::{ConfigValue, Context, Resolution};
use crate::graph::DependencyGraph;
use crate::plan::{fingerprint, planning_context};
use crate::providers::{ListFilter, ProviderRegistry, ResourceExecutor, Target};

type EngineResult<T> = std::result::Result<T, EngineError>;
type ProviderResult<T> = std::result::Result<T, ProviderError>;


/// Deadline per provider operation, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperationTimeouts {
    /// Also bounds `list` probes.
    pub get: u64,
    pub create: u64,
    pub update: u64,
    pub delete: u64,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            get: 60,
            create: 900,
            update: 900,
            delete: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Provider calls allowed in flight at once.
    pub concurrency: usize,
    /// Stop dispatching new nodes after the first failure.
    pub fail_fast: bool,
    pub timeouts: OperationTimeouts,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            fail_fast: false,
            timeouts: OperationTimeouts::default(),
        }
    }
}

/// Stops a running reconciliation from dispatching further nodes.
///
/// Provider calls already issued run to completion and their results are
/// recorded.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Run report plus the graph to persist as the next "previous" snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub report: RunReport,
    pub state: DependencyGraph,
}

/// Executes changesets against the registered resource executors.
#[derive(Clone)]
pub struct Reconciler {
    registry: ProviderRegistry,
    options: EngineOptions,
    cancel: CancelHandle,
}

impl Reconciler {
    #[must_use]
    pub fn new(registry: ProviderRegistry, options: EngineOptions) -> Self {
        Self {
            registry,
            options,
            cancel: CancelHandle::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Apply `changeset`, computed from `previous` and `desired`, phase by phase.
    ///
    /// Within a phase a change starts once every change it depends on has
    /// succeeded; at most `concurrency` provider calls run at once. Provider
    /// failures are recorded on the failing node and block its dependents;
    /// they never abort the run.
    ///
    /// # Errors
    ///
    /// Returns an error only when an engine task dies or the resulting graph
    /// is structurally invalid.
    pub async fn reconcile(
        &self,
        environment: EnvironmentName,
        changeset: Changeset,
        previous: &DependencyGraph,
        desired: &DependencyGraph,
        base: &Context,
    ) -> EngineResult<Reconciliation> {
        let mut run = Run {
            changeset: &changeset,
            previous,
            desired,
            context: planning_context(previous, base),
            state: previous.clone(),
            results: vec![None; changeset.operations.len()],
            applied: BTreeSet::new(),
            stop: None,
        };
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut cancel = self.cancel.subscribe();
        let mut watching = true;

        info!(
            environment = %environment,
            operations = changeset.operations.len(),
            concurrency = self.options.concurrency.max(1),
            "reconciling"
        );

        for phase in Phase::ALL {
            let mut waiting: Vec<usize> = changeset.in_phase(phase).map(|(index, _)| index).collect();
            if waiting.is_empty() {
                continue;
            }
            debug!(phase = phase.as_str(), changes = waiting.len(), "entering phase");
            let mut tasks: JoinSet<Execution> = JoinSet::new();

            loop {
                if run.stop.is_none() && *cancel.borrow() {
                    warn!("cancellation requested; no further nodes will start");
                    run.stop = Some(Stop::Cancelled);
                }
                if run.stop.is_none() {
                    waiting = self.dispatch(&mut run, waiting, &mut tasks, &semaphore);
                }
                if tasks.is_empty() {
                    break;
                }
                tokio::select! {
                    joined = tasks.join_next() => {
                        if let Some(joined) = joined {
                            let execution = joined.map_err(|source| EngineError::Invariant {
                                message: format!("reconciliation task failed: {source}"),
                            })?;
                            run.finish(execution, self.options.fail_fast);
                        }
                    }
                    changed = cancel.changed(), if watching => {
                        watching = changed.is_ok();
                    }
                }
            }

            for index in waiting {
                run.skip(index);
            }
        }

        run.into_reconciliation(environment)
    }

    /// Start every ready change in `waiting`; returns the ones still waiting.
    fn dispatch(
        &self,
        run: &mut Run<'_>,
        waiting: Vec<usize>,
        tasks: &mut JoinSet<Execution>,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<usize> {
        let mut still_waiting = Vec::new();
        for index in waiting {
            if run.stop.is_some() {
                still_waiting.push(index);
                continue;
            }
            match run.readiness(index) {
                Readiness::Waiting => still_waiting.push(index),
                Readiness::Blocked(by) => run.block(index, by),
                Readiness::Cancelled => run.skip(index),
                Readiness::Ready => match run.prepare(index, &self.registry, self.options.timeouts) {
                    Prepared::Unchanged { resolved } => run.unchanged(index, resolved),
                    Prepared::Forgotten => run.forget(index),
                    Prepared::Failed { error, promoted } => {
                        run.fail(index, &error, vec![NodeStatus::Pending, NodeStatus::Error], promoted);
                        if self.options.fail_fast {
                            run.stop = Some(Stop::FailFast);
                        }
                    }
                    Prepared::Call(job) => {
                        let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                            still_waiting.push(index);
                            continue;
                        };
                        let change = &run.changeset.operations[index];
                        info!(
                            node = %change.node,
                            action = change.action.as_str(),
                            phase = change.phase.as_str(),
                            promoted = job.promoted,
                            "dispatching"
                        );
                        tasks.spawn(async move {
                            let execution = execute(job).await;
                            drop(permit);
                            execution
                        });
                    }
                },
            }
        }
        still_waiting
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    FailFast,
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(NodeId),
    Cancelled,
}

enum Prepared {
    /// A planned no-op whose inputs still resolve to what was planned.
    Unchanged { resolved: Value },
    /// A delete of a node that was never provisioned.
    Forgotten,
    Failed { error: ProviderError, promoted: bool },
    Call(Job),
}

/// Provider work for one change before any probe.
enum Call {
    Create { inputs: Value },
    Update { id: Option<String>, inputs: Value },
    Delete { id: Option<String> },
}

/// Provider work once the resource's existence is known.
enum Action {
    Create { inputs: Value },
    Update { id: String, inputs: Value },
    Delete { id: String },
    /// The resource is already gone.
    Forget,
}

impl Call {
    fn known_id(&self) -> Option<&str> {
        match self {
            Self::Create { .. } => None,
            Self::Update { id, .. } | Self::Delete { id } => id.as_deref(),
        }
    }

    fn settle(self, existing: Option<String>) -> Action {
        match (self, existing) {
            (Self::Create { inputs }, _) | (Self::Update { inputs, .. }, None) => {
                Action::Create { inputs }
            }
            (Self::Update { inputs, .. }, Some(id)) => Action::Update { id, inputs },
            (Self::Delete { .. }, Some(id)) => Action::Delete { id },
            (Self::Delete { .. }, None) => Action::Forget,
        }
    }
}

struct Job {
    index: usize,
    executor: Arc<dyn ResourceExecutor>,
    target: Target,
    call: Call,
    probe: bool,
    promoted: bool,
    timeouts: OperationTimeouts,
}

enum Effect {
    Provisioned {
        id: String,
        outputs: Outputs,
        inputs: Value,
        status: NodeStatus,
    },
    Removed,
}

struct Execution {
    index: usize,
    transitions: Vec<NodeStatus>,
    promoted: bool,
    outcome: ProviderResult<Effect>,
}

async fn execute(job: Job) -> Execution {
    let Job {
        index,
        executor,
        target,
        call,
        probe,
        promoted,
        timeouts,
    } = job;
    let mut transitions = vec![NodeStatus::Pending];
    advance(&target.node, &mut transitions, NodeStatus::Initializing);
    let outcome = perform(executor.as_ref(), &target, call, probe, timeouts, &mut transitions).await;
    if outcome.is_err() {
        advance(&target.node, &mut transitions, NodeStatus::Error);
    }
    Execution {
        index,
        transitions,
        promoted,
        outcome,
    }
}

async fn perform(
    executor: &dyn ResourceExecutor,
    target: &Target,
    call: Call,
    probe: bool,
    timeouts: OperationTimeouts,
    transitions: &mut Vec<NodeStatus>,
) -> ProviderResult<Effect> {
    let action = if probe {
        let existing = verify(executor, target, call.known_id(), timeouts).await?;
        call.settle(existing)
    } else {
        let known = call.known_id().map(str::to_string);
        call.settle(known)
    };

    match action {
        Action::Create { inputs } => {
            advance(&target.node, transitions, NodeStatus::Creating);
            let provisioned =
                with_deadline("create", timeouts.create, executor.create(target, &inputs)).await?;
            advance(&target.node, transitions, NodeStatus::Created);
            Ok(Effect::Provisioned {
                id: provisioned.id,
                outputs: provisioned.outputs,
                inputs,
                status: NodeStatus::Created,
            })
        }
        Action::Update { id, inputs } => {
            advance(&target.node, transitions, NodeStatus::Updating);
            let outputs =
                with_deadline("update", timeouts.update, executor.update(target, &id, &inputs))
                    .await?;
            advance(&target.node, transitions, NodeStatus::Complete);
            Ok(Effect::Provisioned {
                id,
                outputs,
                inputs,
                status: NodeStatus::Complete,
            })
        }
        Action::Delete { id } => {
            advance(&target.node, transitions, NodeStatus::Deleting);
            with_deadline("delete", timeouts.delete, executor.delete(target, &id)).await?;
            advance(&target.node, transitions, NodeStatus::Complete);
            Ok(Effect::Removed)
        }
        Action::Forget => {
            debug!(node = %target.node, "resource already absent");
            advance(&target.node, transitions, NodeStatus::Complete);
            Ok(Effect::Removed)
        }
    }
}

/// Probe a node of unverifiable status: `get` by id, or `list` by node name
/// when no id was ever recorded. Returns the id the provider knows it by.
async fn verify(
    executor: &dyn ResourceExecutor,
    target: &Target,
    known: Option<&str>,
    timeouts: OperationTimeouts,
) -> ProviderResult<Option<String>> {
    let observed = match known {
        Some(id) => with_deadline("get", timeouts.get, executor.get(target, id)).await?,
        None => {
            let filter = ListFilter {
                resource_type: target.resource_type,
                node: Some(target.node.clone()),
            };
            with_deadline("list", timeouts.get, executor.list(&filter))
                .await?
                .into_iter()
                .next()
        }
    };
    debug!(node = %target.node, found = observed.is_some(), "probed resource");
    Ok(observed.map(|observed| observed.id))
}

async fn with_deadline<T>(
    operation: &'static str,
    seconds: u64,
    call: impl Future<Output = ProviderResult<T>>,
) -> ProviderResult<T> {
    match tokio::time::timeout(Duration::from_secs(seconds), call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { operation, seconds }),
    }
}

fn advance(node: &NodeId, transitions: &mut Vec<NodeStatus>, status: NodeStatus) {
    debug!(node = %node, status = status.as_str(), "node transition");
    transitions.push(status);
}

/// Mutable bookkeeping of one reconciliation.
struct Run<'a> {
    changeset: &'a Changeset,
    previous: &'a DependencyGraph,
    desired: &'a DependencyGraph,
    context: Context,
    state: DependencyGraph,
    results: Vec<Option<NodeResult>>,
    /// Nodes whose apply-phase change succeeded; their edges come from the desired graph.
    applied: BTreeSet<NodeId>,
    stop: Option<Stop>,
}

impl Run<'_> {
    fn readiness(&self, index: usize) -> Readiness {
        let change = &self.changeset.operations[index];
        for &dependency in &change.depends_on {
            let Some(result) = self.results.get(dependency).and_then(Option::as_ref) else {
                return Readiness::Waiting;
            };
            match result.outcome {
                NodeOutcome::Applied | NodeOutcome::Unchanged => {}
                NodeOutcome::Failed => return Readiness::Blocked(result.node.clone()),
                NodeOutcome::Blocked => {
                    return Readiness::Blocked(
                        result.blocked_by.clone().unwrap_or_else(|| result.node.clone()),
                    );
                }
                NodeOutcome::Cancelled => return Readiness::Cancelled,
            }
        }
        Readiness::Ready
    }

    fn prepare(&self, index: usize, registry: &ProviderRegistry, timeouts: OperationTimeouts) -> Prepared {
        let change = &self.changeset.operations[index];

        let (call, promoted) = match change.action {
            ChangeAction::Delete => {
                if change.provider_id.is_none() && !change.probe {
                    return Prepared::Forgotten;
                }
                (
                    Call::Delete {
                        id: change.provider_id.clone(),
                    },
                    false,
                )
            }
            ChangeAction::Create | ChangeAction::Update | ChangeAction::NoOp => {
                let inputs = match self.resolve(change) {
                    Ok(inputs) => inputs,
                    Err(error) => {
                        return Prepared::Failed {
                            error,
                            promoted: false,
                        };
                    }
                };
                match change.action {
                    ChangeAction::NoOp => {
                        if Some(fingerprint(&inputs)) == change.fingerprint {
                            return Prepared::Unchanged { resolved: inputs };
                        }
                        debug!(node = %change.node, "upstream outputs changed; promoting to update");
                        (
                            Call::Update {
                                id: change.provider_id.clone(),
                                inputs,
                            },
                            true,
                        )
                    }
                    ChangeAction::Update => (
                        Call::Update {
                            id: change.provider_id.clone(),
                            inputs,
                        },
                        false,
                    ),
                    _ => (Call::Create { inputs }, false),
                }
            }
        };

        let executor = match registry.select(change.resource_type) {
            Ok(executor) => executor,
            Err(error) => return Prepared::Failed { error, promoted },
        };
        Prepared::Call(Job {
            index,
            executor,
            target: Target {
                node: change.node.clone(),
                resource_type: change.resource_type,
                previous_outputs: self
                    .previous
                    .node(&change.node)
                    .and_then(|node| node.outputs.clone()),
            },
            call,
            probe: change.probe,
            promoted,
            timeouts,
        })
    }

    /// Resolve the change's inputs against the live context. Every dependency
    /// has finished by now, so a missing value is a failure of this node.
    fn resolve(&self, change: &Change) -> ProviderResult<Value> {
        let parsed = ConfigValue::parse(&change.inputs, "inputs").map_err(|source| {
            ProviderError::UnresolvedReference {
                reference: source.to_string(),
            }
        })?;
        match parsed.resolve(&self.context) {
            Resolution::Resolved(value) => Ok(value),
            Resolution::Pending(missing) => Err(ProviderError::UnresolvedReference {
                reference: missing
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    fn result(&self, index: usize, outcome: NodeOutcome, status: NodeStatus) -> NodeResult {
        let change = &self.changeset.operations[index];
        NodeResult {
            index,
            node: change.node.clone(),
            action: change.action,
            phase: change.phase,
            outcome,
            status,
            transitions: Vec::new(),
            error: None,
            timed_out: false,
            blocked_by: None,
            promoted: false,
        }
    }

    fn desired_node(&self, change: &Change) -> Node {
        self.desired.node(&change.node).cloned().unwrap_or_else(|| {
            Node::new(change.node.clone(), change.resource_type, change.inputs.clone())
        })
    }

    fn unchanged(&mut self, index: usize, resolved: Value) {
        let change = &self.changeset.operations[index];
        let status = self
            .previous
            .node(&change.node)
            .map_or(NodeStatus::Complete, |node| node.status);
        if let Some(node) = self.state.node_mut(&change.node) {
            node.inputs = change.inputs.clone();
            node.resolved_inputs = Some(resolved);
        }
        self.applied.insert(change.node.clone());
        self.results[index] = Some(self.result(index, NodeOutcome::Unchanged, status));
    }

    fn forget(&mut self, index: usize) {
        let change = &self.changeset.operations[index];
        debug!(node = %change.node, "never provisioned; dropping from state");
        self.state.remove_node(&change.node);
        self.results[index] = Some(NodeResult {
            transitions: vec![NodeStatus::Pending, NodeStatus::Complete],
            ..self.result(index, NodeOutcome::Applied, NodeStatus::Complete)
        });
    }

    fn finish(&mut self, execution: Execution, fail_fast: bool) {
        let Execution {
            index,
            transitions,
            promoted,
            outcome,
        } = execution;
        let change = &self.changeset.operations[index];
        match outcome {
            Ok(Effect::Provisioned {
                id,
                outputs,
                inputs,
                status,
            }) => {
                info!(node = %change.node, status = status.as_str(), "applied");
                self.context
                    .insert(change.node.to_string(), Value::Object(outputs.clone()));
                let node = Node {
                    fingerprint: Some(fingerprint(&inputs)),
                    resolved_inputs: Some(inputs),
                    outputs: Some(outputs),
                    provider_id: Some(id),
                    status,
                    message: None,
                    ..self.desired_node(change)
                };
                self.state.upsert_node(node);
                self.applied.insert(change.node.clone());
                self.results[index] = Some(NodeResult {
                    transitions,
                    promoted,
                    ..self.result(index, NodeOutcome::Applied, status)
                });
            }
            Ok(Effect::Removed) => {
                info!(node = %change.node, "deleted");
                self.state.remove_node(&change.node);
                self.results[index] = Some(NodeResult {
                    transitions,
                    ..self.result(index, NodeOutcome::Applied, NodeStatus::Complete)
                });
            }
            Err(error) => {
                self.fail(index, &error, transitions, promoted);
                if fail_fast && self.stop.is_none() {
                    warn!("fail-fast: no further nodes will start");
                    self.stop = Some(Stop::FailFast);
                }
            }
        }
    }

    fn fail(
        &mut self,
        index: usize,
        error: &ProviderError,
        transitions: Vec<NodeStatus>,
        promoted: bool,
    ) {
        let change = &self.changeset.operations[index];
        warn!(node = %change.node, action = change.action.as_str(), error = %error, "node failed");
        let message = error.to_string();
        // A provider call cut off by its deadline may still have landed.
        let mutating = transitions.iter().any(|status| {
            matches!(
                status,
                NodeStatus::Creating | NodeStatus::Updating | NodeStatus::Deleting
            )
        });
        let persisted = if error.is_timeout() && mutating {
            NodeStatus::Unknown
        } else {
            NodeStatus::Error
        };
        if let Some(node) = self.state.node_mut(&change.node) {
            node.status = persisted;
            node.message = Some(message.clone());
        } else {
            let node = Node {
                status: persisted,
                message: Some(message.clone()),
                ..self.desired_node(change)
            };
            self.state.upsert_node(node);
        }
        self.results[index] = Some(NodeResult {
            transitions,
            error: Some(message),
            timed_out: error.is_timeout(),
            promoted,
            ..self.result(index, NodeOutcome::Failed, NodeStatus::Error)
        });
    }

    fn block(&mut self, index: usize, by: NodeId) {
        let change = &self.changeset.operations[index];
        info!(node = %change.node, blocked_by = %by, "blocked by failed dependency");
        self.results[index] = Some(NodeResult {
            transitions: vec![NodeStatus::Pending],
            error: Some(format!("blocked by failed dependency {by}")),
            blocked_by: Some(by),
            ..self.result(index, NodeOutcome::Blocked, NodeStatus::Pending)
        });
    }

    /// Record a change that was never started because the run stopped.
    fn skip(&mut self, index: usize) {
        if let Readiness::Blocked(by) = self.readiness(index) {
            self.block(index, by);
            return;
        }
        let change = &self.changeset.operations[index];
        debug!(node = %change.node, "not started");
        self.results[index] = Some(NodeResult {
            transitions: vec![NodeStatus::Pending],
            ..self.result(index, NodeOutcome::Cancelled, NodeStatus::Pending)
        });
    }

    fn into_reconciliation(self, environment: EnvironmentName) -> EngineResult<Reconciliation> {
        let state = self.settle_edges()?;
        let results: Vec<NodeResult> = self.results.into_iter().flatten().collect();
        let mut failed: Vec<NodeId> = Vec::new();
        for result in &results {
            if result.outcome == NodeOutcome::Failed && !failed.contains(&result.node) {
                failed.push(result.node.clone());
            }
        }
        let report = RunReport {
            environment,
            changeset: self.changeset.clone(),
            results,
            failed,
            cancelled: self.stop == Some(Stop::Cancelled),
        };
        info!(
            outcome = ?report.outcome(),
            failed = report.failed.len(),
            nodes = state.len(),
            "reconciliation finished"
        );
        Ok(Reconciliation { report, state })
    }

    /// Edges for the resulting graph: desired edges for nodes this run applied
    /// or created, previous edges for nodes left as they were.
    fn settle_edges(&self) -> EngineResult<DependencyGraph> {
        let nodes: Vec<Node> = self.state.nodes().cloned().collect();
        let mut edges = BTreeSet::new();
        for node in &nodes {
            let source = if self.applied.contains(&node.id) || !self.previous.contains(&node.id) {
                self.desired
            } else {
                self.previous
            };
            for dependency in source.dependencies(&node.id) {
                if self.state.contains(dependency) {
                    edges.insert(Edge::new(node.id.clone(), dependency.clone()));
                }
            }
        }
        Ok(DependencyGraph::from_parts(nodes, edges.into_iter().collect())?)
    }
}
