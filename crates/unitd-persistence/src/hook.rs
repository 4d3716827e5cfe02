//! ---
//! unitd_section: "03-persistence-logging"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Durable hook and charm records with atomic replace."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::{read_record, write_record};
use crate::{PersistenceError, Result};

/// Lifecycle event a hook responds to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HookKind {
    /// First hook run after the charm is unpacked.
    Install,
    /// Unit is ready to start its workload.
    Start,
    /// Service configuration changed.
    ConfigChanged,
    /// A new charm revision was deployed over the old one.
    UpgradeCharm,
    /// Unit is shutting down.
    Stop,
    /// A remote unit joined a relation.
    RelationJoined,
    /// A remote unit's relation settings changed.
    RelationChanged,
    /// A remote unit left a relation.
    RelationDeparted,
    /// The relation itself is going away.
    RelationBroken,
}

impl HookKind {
    /// Whether this hook belongs to a relation.
    pub fn is_relation(self) -> bool {
        matches!(
            self,
            HookKind::RelationJoined
                | HookKind::RelationChanged
                | HookKind::RelationDeparted
                | HookKind::RelationBroken
        )
    }

    /// Name of the executable under the charm's `hooks/` directory.
    pub fn hook_name(self) -> &'static str {
        self.into()
    }

    fn needs_remote_unit(self) -> bool {
        matches!(
            self,
            HookKind::RelationJoined | HookKind::RelationChanged | HookKind::RelationDeparted
        )
    }
}

/// Reason a [`HookInfo`] is not well formed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} hook: {reason}")]
pub struct InvalidHookInfo {
    /// Kind of the rejected hook.
    pub kind: HookKind,
    /// Which rule was violated.
    pub reason: &'static str,
}

/// Identifies one hook execution request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HookInfo {
    /// Hook kind.
    pub kind: HookKind,
    /// Relation the hook concerns, for relation hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_id: Option<u32>,
    /// Remote unit the hook concerns, for membership hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_unit: Option<String>,
}

impl HookInfo {
    /// Unit-scoped hook with no relation detail.
    pub fn new(kind: HookKind) -> Self {
        Self {
            kind,
            relation_id: None,
            remote_unit: None,
        }
    }

    /// Relation hook for `relation_id`, optionally about `remote_unit`.
    pub fn relation(kind: HookKind, relation_id: u32, remote_unit: Option<String>) -> Self {
        Self {
            kind,
            relation_id: Some(relation_id),
            remote_unit,
        }
    }

    /// Check the relation fields agree with the kind.
    pub fn validate(&self) -> std::result::Result<(), InvalidHookInfo> {
        let invalid = |reason| {
            Err(InvalidHookInfo {
                kind: self.kind,
                reason,
            })
        };
        if !self.kind.is_relation() {
            if self.relation_id.is_some() || self.remote_unit.is_some() {
                return invalid("unit hooks carry no relation detail");
            }
            return Ok(());
        }
        if self.relation_id.is_none() {
            return invalid("missing relation id");
        }
        match (&self.remote_unit, self.kind.needs_remote_unit()) {
            (None, true) => invalid("missing remote unit"),
            (Some(_), false) => invalid("unexpected remote unit"),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for HookInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.hook_name())?;
        if let Some(id) = self.relation_id {
            write!(f, " (relation {id}")?;
            if let Some(remote) = &self.remote_unit {
                write!(f, ", remote {remote}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Progress marker for the hook currently recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HookPhase {
    /// The hook is about to run, or was running when the agent died.
    Started,
    /// The hook exited successfully; its effects are not yet committed.
    Succeeded,
    /// Nothing remains to be done for the hook.
    Committed,
}

/// Unit-level facts updated only when a hook commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitProgress {
    /// A `start` hook has committed since the last `stop`.
    #[serde(default)]
    pub started: bool,
    /// Digest of the configuration consumed by the last committed `config-changed`.
    #[serde(default)]
    pub applied_config: Option<String>,
}

/// Persisted hook record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookState {
    /// Hook being tracked.
    pub hook: HookInfo,
    /// How far it got.
    pub phase: HookPhase,
    /// Digest of the configuration snapshot the hook runs with.
    #[serde(default)]
    pub config_digest: Option<String>,
    /// Committed unit progress.
    #[serde(default)]
    pub progress: UnitProgress,
}

impl HookState {
    /// Whether the hook has started but not yet committed.
    pub fn in_flight(&self) -> bool {
        self.phase != HookPhase::Committed
    }
}

/// Durable record of hook-execution progress for one unit.
///
/// Single writer: exactly one engine owns a store for a given path.
#[derive(Debug)]
pub struct HookStateStore {
    path: PathBuf,
    current: Option<HookState>,
    loaded: bool,
}

impl HookStateStore {
    /// Store backed by the record at `path`. No IO happens until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
            loaded: false,
        }
    }

    /// Record location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted record; `None` when the unit never ran a hook.
    pub fn read(&mut self) -> Result<Option<HookState>> {
        let state: Option<HookState> = read_record(&self.path)?;
        if let Some(state) = &state {
            state
                .hook
                .validate()
                .map_err(|err| PersistenceError::corrupt(&self.path, err.to_string()))?;
        }
        self.current = state.clone();
        self.loaded = true;
        Ok(state)
    }

    /// Persist `phase` for `hook`, keeping unit progress and, for the same hook,
    /// the config digest recorded when it started.
    pub fn write(&mut self, hook: &HookInfo, phase: HookPhase) -> Result<()> {
        self.ensure_loaded()?;
        let (config_digest, progress) = match &self.current {
            Some(current) if &current.hook == hook => {
                (current.config_digest.clone(), current.progress.clone())
            }
            Some(current) => (None, current.progress.clone()),
            None => (None, UnitProgress::default()),
        };
        self.replace(HookState {
            hook: hook.clone(),
            phase,
            config_digest,
            progress,
        })
    }

    /// Mark `hook` started with the digest of the config snapshot it will see.
    pub fn start(&mut self, hook: &HookInfo, config_digest: Option<String>) -> Result<()> {
        self.ensure_loaded()?;
        let progress = self
            .current
            .as_ref()
            .map(|current| current.progress.clone())
            .unwrap_or_default();
        self.replace(HookState {
            hook: hook.clone(),
            phase: HookPhase::Started,
            config_digest,
            progress,
        })
    }

    /// Mark `hook` committed together with the updated unit progress.
    pub fn commit(&mut self, hook: &HookInfo, progress: UnitProgress) -> Result<()> {
        self.ensure_loaded()?;
        let config_digest = self
            .current
            .as_ref()
            .filter(|current| &current.hook == hook)
            .and_then(|current| current.config_digest.clone());
        self.replace(HookState {
            hook: hook.clone(),
            phase: HookPhase::Committed,
            config_digest,
            progress,
        })
    }

    /// Last record written or read.
    pub fn current(&self) -> Option<&HookState> {
        self.current.as_ref()
    }

    /// Committed unit progress, default when nothing was recorded.
    pub fn progress(&self) -> UnitProgress {
        self.current
            .as_ref()
            .map(|current| current.progress.clone())
            .unwrap_or_default()
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if !self.loaded {
            self.read()?;
        }
        Ok(())
    }

    fn replace(&mut self, state: HookState) -> Result<()> {
        write_record(&self.path, &state)?;
        debug!(hook = %state.hook, phase = %state.phase, "hook state written");
        self.current = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hook_names_are_kebab_case() {
        assert_eq!(HookKind::ConfigChanged.hook_name(), "config-changed");
        assert_eq!(HookKind::UpgradeCharm.to_string(), "upgrade-charm");
        assert_eq!("relation-departed".parse::<HookKind>().unwrap(), HookKind::RelationDeparted);
        assert!(HookKind::RelationBroken.is_relation());
        assert!(!HookKind::Install.is_relation());
    }

    #[test]
    fn validate_checks_relation_detail() {
        assert!(HookInfo::new(HookKind::Start).validate().is_ok());
        assert!(HookInfo::relation(HookKind::RelationJoined, 1, Some("db/0".into()))
            .validate()
            .is_ok());
        assert!(HookInfo::relation(HookKind::RelationBroken, 1, None)
            .validate()
            .is_ok());
        assert!(HookInfo::relation(HookKind::RelationChanged, 1, None)
            .validate()
            .is_err());
        assert!(HookInfo::relation(HookKind::RelationBroken, 1, Some("db/0".into()))
            .validate()
            .is_err());
        let stray = HookInfo {
            relation_id: Some(4),
            ..HookInfo::new(HookKind::Install)
        };
        assert!(stray.validate().is_err());
    }

    #[test]
    fn display_includes_relation_detail() {
        let hook = HookInfo::relation(HookKind::RelationJoined, 3, Some("mysql/1".into()));
        assert_eq!(hook.to_string(), "relation-joined (relation 3, remote mysql/1)");
    }

    #[test]
    fn write_preserves_progress_and_digest() {
        let dir = tempdir().unwrap();
        let mut store = HookStateStore::new(dir.path().join("hook"));
        let hook = HookInfo::new(HookKind::ConfigChanged);
        store.start(&hook, Some("abc".into())).unwrap();
        store.write(&hook, HookPhase::Succeeded).unwrap();
        store
            .commit(
                &hook,
                UnitProgress {
                    started: true,
                    applied_config: Some("abc".into()),
                },
            )
            .unwrap();

        let next = HookInfo::new(HookKind::Stop);
        store.write(&next, HookPhase::Started).unwrap();

        let mut reopened = HookStateStore::new(dir.path().join("hook"));
        let state = reopened.read().unwrap().unwrap();
        assert_eq!(state.hook, next);
        assert_eq!(state.phase, HookPhase::Started);
        assert_eq!(state.config_digest, None);
        assert!(state.progress.started);
        assert_eq!(state.progress.applied_config.as_deref(), Some("abc"));
    }

    #[test]
    fn invalid_hook_on_disk_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hook");
        write_record(
            &path,
            &HookState {
                hook: HookInfo {
                    kind: HookKind::RelationJoined,
                    relation_id: None,
                    remote_unit: None,
                },
                phase: HookPhase::Started,
                config_digest: None,
                progress: UnitProgress::default(),
            },
        )
        .unwrap();
        let err = HookStateStore::new(&path).read().unwrap_err();
        assert!(err.is_corrupt());
    }
}
