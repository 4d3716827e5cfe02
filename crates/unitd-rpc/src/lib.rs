//! ---
//! unitd_section: "02-networking-rpc"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "State service call seam, entity accessors and change watchers."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Client side of the central state service.
//!
//! Everything goes through the [`RpcCaller`] primitive: the transport and codec
//! behind it are someone else's concern. On top of it this crate provides the
//! entity accessors used by the unit agent, the [`EntityWatcher`] subscription
//! primitive, and [`memory::InMemoryState`], an in-process implementation of the
//! state service used by tests and by the daemon's local backend.
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod params;
pub mod state;
pub mod task;
pub mod watcher;

pub use memory::{InMemoryState, StateSeed};
pub use params::{
    InvalidPortRange, Life, MachineDoc, Metric, PortRange, Protocol, RebootPriority, ResolvedMode,
    ServiceDoc, UnitDoc, UnitStatus,
};
pub use state::{Machine, Service, StateClient, Unit};
pub use task::{StopSignal, SupervisedTask};
pub use watcher::EntityWatcher;

/// Facade serving unit entities.
pub const UNIT_FACADE: &str = "Unit";
/// Facade serving service entities.
pub const SERVICE_FACADE: &str = "Service";
/// Facade serving machine entities.
pub const MACHINE_FACADE: &str = "Machine";
/// Facade serving watcher `Next`/`Stop` calls.
pub const WATCHER_FACADE: &str = "EntityWatcher";

/// Result alias used throughout the RPC crate.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Error codes the state service attaches to failed calls.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCode {
    /// The watcher was stopped while a call was outstanding.
    Stopped,
    /// The addressed entity or watcher does not exist.
    NotFound,
    /// The caller may not perform the request.
    Unauthorized,
    /// The entity has no provisioned instance yet.
    NotProvisioned,
    /// The arguments were rejected.
    BadRequest,
    /// The facade or method is not served.
    NotImplemented,
}

/// Failure of a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// Connectivity failure; the request may or may not have been applied.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service processed the request and refused it.
    #[error("{code}: {message}")]
    Server {
        /// Classification of the refusal.
        code: ErrorCode,
        /// Human readable detail.
        message: String,
    },
    /// A supervised client task ended abnormally.
    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl RpcError {
    /// Build a server-side error.
    pub fn server(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError::Server {
            code,
            message: message.into(),
        }
    }

    /// Code carried by a server error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RpcError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error reports a stopped or vanished watcher.
    pub fn is_stopped_or_not_found(&self) -> bool {
        matches!(self.code(), Some(ErrorCode::Stopped | ErrorCode::NotFound))
    }

    /// Whether retrying the same request could succeed.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::server(ErrorCode::BadRequest, err.to_string())
    }
}

impl From<tokio::task::JoinError> for RpcError {
    fn from(err: tokio::task::JoinError) -> Self {
        RpcError::TaskFailed(err.to_string())
    }
}

/// The single call primitive everything else is built on.
///
/// `id` addresses an entity (unit name, service name, machine id) or a watcher.
#[async_trait]
pub trait RpcCaller: Send + Sync + 'static {
    /// Perform `facade.method` on `id` with JSON `args`.
    async fn call(
        &self,
        facade: &str,
        id: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_watcher_termination() {
        assert!(RpcError::server(ErrorCode::Stopped, "watcher stopped").is_stopped_or_not_found());
        assert!(RpcError::server(ErrorCode::NotFound, "unknown watcher").is_stopped_or_not_found());
        assert!(!RpcError::server(ErrorCode::Unauthorized, "no").is_stopped_or_not_found());
        assert!(!RpcError::Transport("reset".into()).is_stopped_or_not_found());
        assert!(RpcError::Transport("reset".into()).is_transport());
    }

    #[test]
    fn server_errors_render_code() {
        let err = RpcError::server(ErrorCode::NotProvisioned, "machine 3 not provisioned");
        assert_eq!(err.to_string(), "not-provisioned: machine 3 not provisioned");
    }
}
