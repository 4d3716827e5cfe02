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
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::record::{read_record, write_record};
use crate::{PersistenceError, Result};

/// Rejected charm reference text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid charm reference {input:?}: {reason}")]
pub struct InvalidCharmRef {
    /// Text that failed to parse.
    pub input: String,
    /// Which part was wrong.
    pub reason: &'static str,
}

/// Versioned charm identifier of the form `schema:[series/]name-revision`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CharmRef {
    text: String,
    revision: u32,
}

impl CharmRef {
    /// Parse and validate a charm reference.
    pub fn parse(input: &str) -> std::result::Result<Self, InvalidCharmRef> {
        let invalid = |reason| InvalidCharmRef {
            input: input.to_owned(),
            reason,
        };
        let (schema, rest) = input.split_once(':').ok_or_else(|| invalid("missing schema"))?;
        if schema.is_empty() || !schema.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("schema must be alphanumeric"));
        }
        let named = match rest.split_once('/') {
            Some((series, named)) => {
                if series.is_empty() || !series.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(invalid("series must be alphanumeric"));
                }
                named
            }
            None => rest,
        };
        let (name, revision) = named
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing revision"))?;
        if revision.is_empty() || !revision.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("revision must be numeric"));
        }
        let revision = revision
            .parse::<u32>()
            .map_err(|_| invalid("revision out of range"))?;
        let mut chars = name.chars();
        let leading_letter = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let trailing_alnum = name
            .chars()
            .next_back()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        if !leading_letter
            || !trailing_alnum
            || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid("name must be lowercase alphanumeric"));
        }
        Ok(Self {
            text: input.to_owned(),
            revision,
        })
    }

    /// Reference as text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Charm name without schema, series, or revision.
    pub fn name(&self) -> &str {
        let named = self.named_part();
        named.rsplit_once('-').map(|(name, _)| name).unwrap_or(named)
    }

    /// Charm revision.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Filesystem-safe rendering, unique per reference.
    pub fn dir_name(&self) -> String {
        self.text.replace([':', '/'], "_")
    }

    fn named_part(&self) -> &str {
        let rest = self.text.split_once(':').map(|(_, rest)| rest).unwrap_or(&self.text);
        rest.rsplit_once('/').map(|(_, named)| named).unwrap_or(rest)
    }
}

impl fmt::Display for CharmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for CharmRef {
    type Err = InvalidCharmRef;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CharmRef {
    type Error = InvalidCharmRef;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CharmRef> for String {
    fn from(value: CharmRef) -> Self {
        value.text
    }
}

/// Deployment status of the unit's charm directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CharmStatus {
    /// No change in progress.
    Installed,
    /// First deployment in progress.
    Installing,
    /// Replacement of a deployed charm in progress.
    Upgrading,
}

/// Kind of a pending charm change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CharmChangeKind {
    /// First deployment; followed by the `install` hook.
    Installing,
    /// Replacement; followed by the `upgrade-charm` hook.
    Upgrading,
}

impl From<CharmChangeKind> for CharmStatus {
    fn from(kind: CharmChangeKind) -> Self {
        match kind {
            CharmChangeKind::Installing => CharmStatus::Installing,
            CharmChangeKind::Upgrading => CharmStatus::Upgrading,
        }
    }
}

/// A charm change recorded before any file is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharmChangeIntent {
    /// Install or upgrade.
    pub kind: CharmChangeKind,
    /// Target charm.
    pub charm: CharmRef,
}

/// Persisted charm record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharmState {
    /// Current status.
    pub status: CharmStatus,
    /// Target charm while changing; last deployed charm once installed.
    #[serde(default)]
    pub charm: Option<CharmRef>,
}

impl CharmState {
    /// Pending change, if any.
    pub fn intent(&self) -> Option<CharmChangeIntent> {
        let kind = match self.status {
            CharmStatus::Installed => return None,
            CharmStatus::Installing => CharmChangeKind::Installing,
            CharmStatus::Upgrading => CharmChangeKind::Upgrading,
        };
        self.charm.clone().map(|charm| CharmChangeIntent { kind, charm })
    }
}

/// Record file holding the [`CharmState`] of one unit.
#[derive(Debug, Clone)]
pub struct CharmStateFile {
    path: PathBuf,
}

impl CharmStateFile {
    /// Record stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Record location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record; `None` if no charm was ever deployed.
    pub fn read(&self) -> Result<Option<CharmState>> {
        let state: Option<CharmState> = read_record(&self.path)?;
        if let Some(state) = &state {
            if state.status != CharmStatus::Installed && state.charm.is_none() {
                return Err(PersistenceError::corrupt(
                    &self.path,
                    format!("{} status without a charm reference", state.status),
                ));
            }
        }
        Ok(state)
    }

    /// Atomically replace the record.
    pub fn write(&self, state: &CharmState) -> Result<()> {
        write_record(&self.path, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_charm_references() {
        let charm = CharmRef::parse("local:trusty/wordpress-3").unwrap();
        assert_eq!(charm.name(), "wordpress");
        assert_eq!(charm.revision(), 3);
        assert_eq!(charm.dir_name(), "local_trusty_wordpress-3");

        let bare: CharmRef = "cs:mysql-fork-12".parse().unwrap();
        assert_eq!(bare.name(), "mysql-fork");
        assert_eq!(bare.revision(), 12);
    }

    #[test]
    fn rejects_malformed_references() {
        for input in ["wordpress-3", "local:wordpress", "local:wordpress-x", ":w-1", "local:/w-1", "local:Word-1"] {
            assert!(CharmRef::parse(input).is_err(), "{input} accepted");
        }
    }

    #[test]
    fn rejects_revision_beyond_u32() {
        let err = CharmRef::parse("local:wordpress-99999999999").unwrap_err();
        assert_eq!(err.reason, "revision out of range");
        let max = CharmRef::parse("local:wordpress-4294967295").unwrap();
        assert_eq!(max.revision(), u32::MAX);
    }

    #[test]
    fn rejects_name_ending_in_hyphen() {
        assert!(CharmRef::parse("local:foo--3").is_err());
        assert!(CharmRef::parse("cs:trusty/foo--3").is_err());
        assert_eq!(CharmRef::parse("local:foo-2-3").unwrap().name(), "foo-2");
    }

    #[test]
    fn stored_revision_survives_serde() {
        let charm = CharmRef::parse("cs:precise/mysql-12").unwrap();
        let text = serde_json::to_string(&charm).unwrap();
        assert_eq!(text, "\"cs:precise/mysql-12\"");
        let back: CharmRef = serde_json::from_str(&text).unwrap();
        assert_eq!(back.revision(), 12);
        assert!(serde_json::from_str::<CharmRef>("\"cs:mysql-99999999999\"").is_err());
    }

    #[test]
    fn intent_only_while_changing() {
        let charm = CharmRef::parse("local:wordpress-1").unwrap();
        let installed = CharmState {
            status: CharmStatus::Installed,
            charm: Some(charm.clone()),
        };
        assert!(installed.intent().is_none());

        let upgrading = CharmState {
            status: CharmStatus::Upgrading,
            charm: Some(charm.clone()),
        };
        assert_eq!(
            upgrading.intent(),
            Some(CharmChangeIntent {
                kind: CharmChangeKind::Upgrading,
                charm
            })
        );
    }

    #[test]
    fn changing_status_without_charm_is_corrupt() {
        let dir = tempdir().unwrap();
        let file = CharmStateFile::new(dir.path().join("charm"));
        file.write(&CharmState {
            status: CharmStatus::Installing,
            charm: None,
        })
        .unwrap();
        assert!(file.read().unwrap_err().is_corrupt());
    }

    #[test]
    fn invalid_reference_on_disk_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("charm");
        write_record(
            &path,
            &serde_json::json!({"status": "installing", "charm": "not a ref"}),
        )
        .unwrap();
        assert!(CharmStateFile::new(&path).read().unwrap_err().is_corrupt());
    }
}
