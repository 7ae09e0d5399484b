use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod resource;

pub use resource::{ResourceSchema, ResourceType};

/// Output values published by a node after a successful apply.
pub type Outputs = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainValidationError {
    #[error("node name must not be empty")]
    EmptyNodeId,
    #[error(
        "invalid node name \"{id}\" (expected letters, digits, '_' or '-', starting with a letter or '_')"
    )]
    InvalidNodeId { id: String },
    #[error("environment name must not be empty")]
    EmptyEnvironmentName,
    #[error("invalid environment name \"{name}\" (expected letters, digits, '_' or '-')")]
    InvalidEnvironmentName { name: String },
    #[error("unknown resource type \"{name}\"")]
    UnknownResourceType { name: String },
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

/// Stable identity of a node: its logical name in the configuration.
///
/// Identities never contain `.`, so the first segment of a reference path is
/// always a complete node name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node identity, rejecting names that cannot be addressed by a reference.
    ///
    /// # Errors
    ///
    /// Returns an error when `id` is empty or contains characters outside
    /// `[A-Za-z0-9_-]`.
    pub fn new(id: String) -> Result<Self, DomainValidationError> {
        if id.is_empty() {
            Err(DomainValidationError::EmptyNodeId)
        } else if is_identifier(&id) {
            Ok(Self(id))
        } else {
            Err(DomainValidationError::InvalidNodeId { id })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NodeId {
    type Error = DomainValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl Deref for NodeId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

/// Key under which a graph snapshot is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EnvironmentName(String);

impl EnvironmentName {
    /// Create an environment name usable as a state key.
    ///
    /// # Errors
    ///
    /// Returns an error when `name` is empty or not a plain identifier.
    pub fn new(name: String) -> Result<Self, DomainValidationError> {
        if name.is_empty() {
            Err(DomainValidationError::EmptyEnvironmentName)
        } else if name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            Ok(Self(name))
        } else {
            Err(DomainValidationError::InvalidEnvironmentName { name })
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EnvironmentName {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl TryFrom<String> for EnvironmentName {
    type Error = DomainValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EnvironmentName {
    type Error = DomainValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

impl fmt::Display for EnvironmentName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

impl From<EnvironmentName> for String {
    fn from(value: EnvironmentName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Initializing,
    Creating,
    Created,
    Updating,
    Deleting,
    Complete,
    Error,
    Unknown,
}

impl NodeStatus {
    /// Terminal success: dependents may start.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Created | Self::Complete)
    }

    /// A provider call may be outstanding.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Creating | Self::Updating | Self::Deleting
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// `from` depends on `to`: `to` must be applied before `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

impl Edge {
    #[must_use]
    pub const fn new(from: NodeId, to: NodeId) -> Self {
        Self { from, to }
    }

    #[must_use]
    pub fn id(&self) -> String {
        format!("{}-{}", self.from, self.to)
    }

    #[must_use]
    pub fn reverse(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }

    #[must_use]
    pub fn is_self_referential(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} -> {}", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub resource_type: ResourceType,
    /// Inputs as written in configuration, references included.
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    /// Identifier the provider returned from `create`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Node {
    #[must_use]
    pub const fn new(id: NodeId, resource_type: ResourceType, inputs: Value) -> Self {
        Self {
            id,
            resource_type,
            inputs,
            resolved_inputs: None,
            outputs: None,
            provider_id: None,
            fingerprint: None,
            status: NodeStatus::Pending,
            message: None,
        }
    }

    /// Whether a provider resource is known to exist for this node.
    #[must_use]
    pub const fn is_provisioned(&self) -> bool {
        self.provider_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "no-op")]
    NoOp,
}

impl ChangeAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        }
    }

    #[must_use]
    pub const fn mutates(self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Execution phase of a change. Phases run strictly one after another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Deletes of removed or replaced nodes, dependents first.
    Teardown,
    /// Creates, updates and no-ops in dependency order.
    Apply,
    /// Deletes that must wait for a surviving dependent to move off the node.
    Cleanup,
}

impl Phase {
    pub const ALL: [Self; 3] = [Self::Teardown, Self::Apply, Self::Cleanup];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Teardown => "teardown",
            Self::Apply => "apply",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub node: NodeId,
    pub resource_type: ResourceType,
    pub action: ChangeAction,
    pub phase: Phase,
    /// Part of a delete-then-create pair forced by a replacement-triggering field.
    #[serde(default)]
    pub replacement: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Desired raw inputs for create/update/no-op, last resolved inputs for delete.
    pub inputs: Value,
    /// Inputs resolved at planning time, when every reference was already known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_inputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Previous status could not be trusted; the node must be probed first.
    #[serde(default)]
    pub probe: bool,
    /// Indices of earlier changes that must succeed before this one starts.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_op: usize,
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.no_op
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Changeset {
    pub operations: Vec<Change>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Changeset {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|change| change.action.mutates())
    }

    /// The `(node, action)` sequence in execution order.
    #[must_use]
    pub fn actions(&self) -> Vec<(&str, ChangeAction)> {
        self.operations
            .iter()
            .map(|change| (change.node.as_str(), change.action))
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for change in &self.operations {
            match change.action {
                ChangeAction::Create => summary.create += 1,
                ChangeAction::Update => summary.update += 1,
                ChangeAction::Delete => summary.delete += 1,
                ChangeAction::NoOp => summary.no_op += 1,
            }
        }
        summary
    }

    pub fn in_phase(&self, phase: Phase) -> impl Iterator<Item = (usize, &Change)> {
        self.operations
            .iter()
            .enumerate()
            .filter(move |(_, change)| change.phase == phase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Applied,
    Unchanged,
    Failed,
    Blocked,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Index of the change in the changeset.
    pub index: usize,
    pub node: NodeId,
    pub action: ChangeAction,
    pub phase: Phase,
    pub outcome: NodeOutcome,
    pub status: NodeStatus,
    /// Every status the node passed through during the run, in order.
    pub transitions: Vec<NodeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
    /// Upstream failure that prevented this node from starting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<NodeId>,
    /// A planned no-op that was applied as an update after its inputs drifted.
    #[serde(default)]
    pub promoted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartiallyFailed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub environment: EnvironmentName,
    pub changeset: Changeset,
    pub results: Vec<NodeResult>,
    pub failed: Vec<NodeId>,
    #[serde(default)]
    pub cancelled: bool,
}

impl RunReport {
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if !self.failed.is_empty() {
            RunOutcome::PartiallyFailed
        } else if self.cancelled {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Succeeded
        }
    }

    /// The last result recorded for `node` (a replaced node has two).
    #[must_use]
    pub fn result(&self, node: &str) -> Option<&NodeResult> {
        self.results
            .iter()
            .rev()
            .find(|result| result.node.as_str() == node)
    }
}
