use std::io;
use std::path::PathBuf;

use strata_domain::{DomainValidationError, NodeId, ResourceType};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("malformed reference \"{raw}\" in {field}: {reason}")]
    Parse {
        raw: String,
        field: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("edge {from} -> {to} points at missing node {missing}")]
    DanglingEdge {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },
    #[error("node {node} cannot depend on itself")]
    SelfCycle { node: NodeId },
    #[error("dependency cycle detected among: {cycle}")]
    CycleDetected { cycle: String },
    #[error("node {node} is declared more than once")]
    DuplicateNode { node: NodeId },
    #[error("node {node} does not exist in the graph")]
    MissingNode { node: NodeId },
    #[error("{message}")]
    Invariant { message: String },
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read configuration document: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: unsupported document version \"{version}\" (expected v1 or v2)")]
    UnsupportedVersion { path: PathBuf, version: String },
    #[error("{path}: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: DomainValidationError,
    },
    #[error("resource \"{name}\" is declared in both {first} and {second}")]
    DuplicateResource {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("conflicting environment names \"{first}\" and \"{second}\"")]
    ConflictingEnvironment { first: String, second: String },
    #[error("conflicting values for vars.{key}")]
    ConflictingVar { key: String },
    #[error("settings are declared in both {first} and {second}")]
    DuplicateSettings { first: PathBuf, second: PathBuf },
    #[error("provider module for {resource_type} is declared more than once")]
    DuplicateProvider { resource_type: ResourceType },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("configuration source does not exist: {path}")]
    SourceDoesNotExist { path: PathBuf },
    #[error("failed to canonicalize configuration path: {path}")]
    CanonicalizePath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed while walking configuration directory")]
    Walk {
        #[source]
        source: walkdir::Error,
    },
    #[error("no configuration documents found under {path} (expected .yml, .yaml or .json)")]
    NoDocuments { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("node {node}: {source}")]
    Expression {
        node: NodeId,
        #[source]
        source: ExpressionError,
    },
    #[error("node {node} references unknown root \"{root}\" in {reference}")]
    UnknownReference {
        node: NodeId,
        root: String,
        reference: String,
    },
    #[error("node {node} ({resource_type}) is missing required input \"{input}\"")]
    MissingInput {
        node: NodeId,
        resource_type: ResourceType,
        input: &'static str,
    },
    #[error("node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: NodeId, dependency: NodeId },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Failure of a single provider call. Never fatal to a run: the engine records
/// it on the failing node and blocks that node's dependents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("no resource executor registered for {resource_type}")]
    NotRegistered { resource_type: ResourceType },
    #[error("{operation} failed: {message}")]
    Call {
        operation: &'static str,
        message: String,
    },
    #[error("module {module} is unavailable: {reason}")]
    Unavailable { module: String, reason: String },
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },
    #[error("reference {reference} is not available")]
    UnresolvedReference { reference: String },
    #[error("resource {id} was not found")]
    NotFound { id: String },
}

impl ProviderError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state snapshot: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode state snapshot: {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode state snapshot")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write state snapshot: {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: unsupported state format version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("node {node}: {source}")]
    Expression {
        node: NodeId,
        #[source]
        source: ExpressionError,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{message}")]
    Invariant { message: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    State(#[from] StateError),
}
