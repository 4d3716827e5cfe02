//! ---
//! unitd_section: "01-core-functionality"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Shared primitives and utilities for the unit agent."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Shared primitives for the unitd workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the agent crates and the daemon binary.

pub mod config;
pub mod logging;

pub use config::{
    AgentConfig, CommitRetryConfig, HookConfig, LoadedAgentConfig, LoggingConfig, MetricsConfig,
    StateConfig, UniterConfig, UnitPaths,
};
pub use logging::{init_tracing, LogFormat, LogGuards};
