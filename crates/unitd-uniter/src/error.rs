//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use unitd_persistence::{CharmRef, HookInfo, InvalidCharmRef, PersistenceError};
use unitd_rpc::{InvalidPortRange, PortRange, RpcError};

/// Errors returned to a hook tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The request named a context other than the active one.
    #[error("context id {got:?} does not match the active hook context")]
    Auth { expected: String, got: String },
    /// The charm declares no metrics.
    #[error("metrics are disabled: the charm declares no metrics")]
    MetricsDisabled,
    #[error("metric {0:?} is not declared by the charm")]
    UndeclaredMetric(String),
    #[error("invalid value {value:?} for metric {key:?}: {reason}")]
    InvalidMetricValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("metric {0:?} uses a reserved prefix")]
    ReservedMetric(String),
    #[error("port range {requested} conflicts with {existing}")]
    PortRangeConflict {
        requested: PortRange,
        existing: PortRange,
    },
    #[error(transparent)]
    InvalidPortRange(#[from] InvalidPortRange),
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
    #[error("{tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("{0} is not implemented")]
    NotImplemented(String),
}

impl ContextError {
    /// Exit status reported to the hook tool.
    pub fn exit_code(&self) -> i32 {
        match self {
            ContextError::Auth { .. } => 2,
            _ => 1,
        }
    }

    pub(crate) fn arguments(tool: &str, reason: impl Into<String>) -> Self {
        ContextError::InvalidArguments {
            tool: tool.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Failures while deploying a charm.
#[derive(Debug, Error)]
pub enum CharmError {
    #[error("charm {charm} not found in repository {}", path.display())]
    NotFound { charm: CharmRef, path: PathBuf },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot walk charm tree: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("invalid metrics declaration {}: {source}", path.display())]
    Metrics {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("cannot publish charm {charm}: {source}")]
    Commit {
        charm: CharmRef,
        #[source]
        source: RpcError,
    },
}

impl CharmError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| CharmError::Io { path, source }
    }
}

/// A hook process that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hook {hook} failed: {reason}")]
pub struct HookFailure {
    pub hook: HookInfo,
    pub reason: String,
    /// Exit status, when the process ran to completion.
    pub exit_code: Option<i32>,
}

/// Engine-fatal errors. The mode loop stops and the error reaches the owner.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("state service call failed: {0}")]
    Transport(#[from] RpcError),
    #[error("watcher for {entity} failed: {source}")]
    Watcher { entity: String, source: RpcError },
    #[error(transparent)]
    Persistence(Arc<PersistenceError>),
    #[error(transparent)]
    Charm(Arc<CharmError>),
    #[error("invalid charm from state service: {0}")]
    InvalidCharm(#[from] InvalidCharmRef),
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("{0} is not implemented")]
    NotImplemented(String),
    #[error("engine task failed: {0}")]
    Task(String),
}

impl From<PersistenceError> for EngineError {
    fn from(err: PersistenceError) -> Self {
        EngineError::Persistence(Arc::new(err))
    }
}

impl From<CharmError> for EngineError {
    fn from(err: CharmError) -> Self {
        match err {
            CharmError::Persistence(err) => EngineError::from(err),
            other => EngineError::Charm(Arc::new(other)),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Task(err.to_string())
    }
}

impl EngineError {
    /// Whether the error reports a corrupt persisted record.
    pub fn is_corrupt_state(&self) -> bool {
        matches!(self, EngineError::Persistence(err) if err.is_corrupt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_use_distinct_exit_code() {
        let auth = ContextError::Auth {
            expected: "a".into(),
            got: "b".into(),
        };
        assert_eq!(auth.exit_code(), 2);
        assert_eq!(ContextError::MetricsDisabled.exit_code(), 1);
    }

    #[test]
    fn charm_persistence_errors_stay_persistence_errors() {
        let corrupt = PersistenceError::Corrupt {
            path: "/x".into(),
            reason: "digest mismatch".into(),
        };
        let err = EngineError::from(CharmError::Persistence(corrupt));
        assert!(err.is_corrupt_state());
    }
}
