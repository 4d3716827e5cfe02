//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Per-unit agent: deploys the unit's charm, runs its hooks one at a time and
//! resumes exactly where it left off after a crash.

pub mod charm;
pub mod context;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod runner;
pub mod tools;

pub use charm::{
    CharmDeploymentTracker, CharmSource, LocalCharmRepository, MetricKind, MetricSpec,
    MetricsDeclaration,
};
pub use context::{config_digest, ContextOutcome, HookContext};
pub use engine::{Mode, UniterEngine};
pub use error::{CharmError, ContextError, EngineError, HookFailure};
pub use ipc::{invoke, ContextServer, ToolRequest, ToolResponse};
pub use runner::{HookExecutor, HookRun, ProcessHookExecutor, ENV_AGENT_SOCKET, ENV_CONTEXT_ID};
pub use tools::run_tool;
