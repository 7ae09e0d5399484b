mod apply;
mod builder;
mod discovery;
mod document;
mod error;
mod expression;
mod graph;
mod module;
mod pipeline;
mod plan;
mod providers;
mod state;
#[cfg(test)]
mod testing;

pub use apply::{CancelHandle, EngineOptions, OperationTimeouts, Reconciler, Reconciliation};
pub use builder::{DesiredGraph, STATIC_ROOTS, build_graph, static_context};
pub use discovery::discover_documents;
pub use document::{
    Configuration, ModuleSpec, ResourceDeclaration, load_document, parse_document,
};
pub use error::{
    BuildError, DiscoveryError, DocumentError, EngineError, ExpressionError, GraphError,
    PipelineError, PlanningError, ProviderError, StateError,
};
pub use expression::{
    ConfigValue, Context, Fragment, Reference, Resolution, find_references, resolve, substitute,
};
pub use graph::DependencyGraph;
pub use module::{
    CommandModuleRunner, ModuleAction, ModuleExecutor, ModuleRequest, ModuleResponse,
    ModuleRunner, registry_from_modules,
};
pub use pipeline::{
    Outcome, Plan, execute, load_configuration, plan, plan_destroy, sensitive_values_of,
};
pub use plan::{diff, fingerprint, planning_context};
pub use providers::{
    ListFilter, Observed, ProviderRegistry, Provisioned, ResourceExecutor, Target,
};
pub use state::{FileStateStore, MemoryStateStore, STATE_FORMAT_VERSION, Snapshot, StateStore};
