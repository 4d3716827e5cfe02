//! ---
//! unitd_section: "03-persistence-logging"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Durable hook and charm records with atomic replace."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
#![warn(missing_docs)]

use std::path::PathBuf;

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing record files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues on the write path.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A persisted record exists but cannot be trusted.
    #[error("corrupt state record {}: {reason}", path.display())]
    Corrupt {
        /// Record location.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}

impl PersistenceError {
    /// Whether the error reports a malformed persisted record.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, PersistenceError::Corrupt { .. })
    }

    pub(crate) fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        PersistenceError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

pub mod charm;
pub mod hook;
pub mod record;

pub use charm::{
    CharmChangeIntent, CharmChangeKind, CharmRef, CharmState, CharmStateFile, CharmStatus,
    InvalidCharmRef,
};
pub use hook::{
    HookInfo, HookKind, HookPhase, HookState, HookStateStore, InvalidHookInfo, UnitProgress,
};
pub use record::{read_record, write_record, RECORD_VERSION};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_error_mentions_path() {
        let err = PersistenceError::corrupt(std::path::Path::new("/x/state/hook"), "digest mismatch");
        assert!(err.is_corrupt());
        assert_eq!(
            format!("{err}"),
            "corrupt state record /x/state/hook: digest mismatch"
        );
    }
}
