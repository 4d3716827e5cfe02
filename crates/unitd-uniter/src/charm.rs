//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Charm deployment: intent record, tree mirroring and remote publication.
//!
//! A change is recorded with [`CharmDeploymentTracker::begin`] before the
//! working tree is touched. The record only returns to `installed` once the
//! hook that follows the change has been marked started, so a crash anywhere
//! in between resumes the same change.
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use unitd_common::{CommitRetryConfig, UnitPaths};
use unitd_persistence::{
    CharmChangeIntent, CharmChangeKind, CharmRef, CharmState, CharmStateFile, CharmStatus,
};
use unitd_rpc::Unit;
use walkdir::WalkDir;

use crate::error::CharmError;

/// Marker written at the root of a deployed tree, holding the charm reference.
pub const CHARM_MARKER: &str = ".unitd-charm";
const METRICS_FILE: &str = "metrics.yaml";

type Result<T> = std::result::Result<T, CharmError>;

/// Resolves a charm reference to an unpacked bundle directory.
pub trait CharmSource: Send + Sync {
    fn bundle_dir(&self, charm: &CharmRef) -> Result<PathBuf>;
}

/// Bundles unpacked under a local directory, one per reference.
///
/// `local:trusty/wordpress-3` is looked up as `local_trusty_wordpress-3`,
/// falling back to `wordpress-3`.
#[derive(Debug, Clone)]
pub struct LocalCharmRepository {
    root: PathBuf,
}

impl LocalCharmRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CharmSource for LocalCharmRepository {
    fn bundle_dir(&self, charm: &CharmRef) -> Result<PathBuf> {
        let exact = self.root.join(charm.dir_name());
        if exact.is_dir() {
            return Ok(exact);
        }
        let short = self
            .root
            .join(format!("{}-{}", charm.name(), charm.revision()));
        if short.is_dir() {
            return Ok(short);
        }
        Err(CharmError::NotFound {
            charm: charm.clone(),
            path: self.root.clone(),
        })
    }
}

/// Kind of a declared charm metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Any number.
    Gauge,
    /// A non-negative number.
    Absolute,
}

impl MetricKind {
    pub fn check(self, value: &str) -> std::result::Result<(), String> {
        let number: f64 = value
            .parse()
            .map_err(|_| "value must be a number".to_owned())?;
        if !number.is_finite() {
            return Err("value must be finite".to_owned());
        }
        if self == MetricKind::Absolute && number < 0.0 {
            return Err("absolute metrics must not be negative".to_owned());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricSpec {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default)]
    pub description: String,
}

/// Parsed `metrics.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetricsDeclaration {
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSpec>,
}

impl MetricsDeclaration {
    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn get(&self, key: &str) -> Option<&MetricSpec> {
        self.metrics.get(key)
    }
}

/// Owns the charm-state record and the deployed tree of one unit.
pub struct CharmDeploymentTracker {
    charm_dir: PathBuf,
    record: CharmStateFile,
    source: Arc<dyn CharmSource>,
    retry: CommitRetryConfig,
}

impl std::fmt::Debug for CharmDeploymentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharmDeploymentTracker")
            .field("charm_dir", &self.charm_dir)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl CharmDeploymentTracker {
    pub fn new(paths: &UnitPaths, source: Arc<dyn CharmSource>, retry: CommitRetryConfig) -> Self {
        Self {
            charm_dir: paths.charm_dir.clone(),
            record: CharmStateFile::new(&paths.charm_state),
            source,
            retry,
        }
    }

    pub fn charm_dir(&self) -> &Path {
        &self.charm_dir
    }

    /// Change recorded by [`begin`](Self::begin) and not yet cleared.
    pub fn pending(&self) -> Result<Option<CharmChangeIntent>> {
        Ok(self.record.read()?.and_then(|state| state.intent()))
    }

    /// Charm whose change has completed, if any.
    pub fn deployed(&self) -> Result<Option<CharmRef>> {
        Ok(self
            .record
            .read()?
            .filter(|state| state.status == CharmStatus::Installed)
            .and_then(|state| state.charm))
    }

    /// Record the intent to move to `charm`. Must precede any change to the tree.
    pub fn begin(&self, charm: &CharmRef, kind: CharmChangeKind) -> Result<()> {
        info!(charm = %charm, kind = %kind, "charm change recorded");
        self.record.write(&CharmState {
            status: kind.into(),
            charm: Some(charm.clone()),
        })?;
        Ok(())
    }

    /// Mirror the bundle for `charm` into the working tree.
    ///
    /// Files are replaced atomically when their content or mode differs,
    /// entries absent from the bundle are removed, and the marker is written
    /// last. Running it again over a complete or partial tree converges to
    /// the same result.
    pub fn apply(&self, charm: &CharmRef) -> Result<()> {
        let bundle = self.source.bundle_dir(charm)?;
        fs::create_dir_all(&self.charm_dir).map_err(CharmError::io(&self.charm_dir))?;

        let mut wanted: HashSet<PathBuf> = HashSet::new();
        let mut changed = 0usize;
        for entry in WalkDir::new(&bundle).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(&bundle)
                .map_err(|_| CharmError::Io {
                    path: entry.path().to_path_buf(),
                    source: ErrorKind::InvalidInput.into(),
                })?
                .to_path_buf();
            if relative.as_os_str() == CHARM_MARKER {
                continue;
            }
            let target = self.charm_dir.join(&relative);
            let file_type = entry.file_type();
            let updated = if file_type.is_dir() {
                mirror_dir(&target)?
            } else if file_type.is_symlink() {
                mirror_symlink(entry.path(), &target)?
            } else {
                mirror_file(entry.path(), &target)?
            };
            if updated {
                changed += 1;
            }
            wanted.insert(relative);
        }

        let removed = self.remove_stale(&wanted)?;
        let marker = self.charm_dir.join(CHARM_MARKER);
        let marker_current = fs::read_to_string(&marker)
            .map(|content| content == charm.as_str())
            .unwrap_or(false);
        if !marker_current {
            write_atomic(&marker, charm.as_str().as_bytes(), None)?;
        }
        info!(charm = %charm, changed, removed, "charm tree applied");
        Ok(())
    }

    /// Publish `charm` as the unit's deployed charm, retrying transport failures.
    pub async fn remote_commit(&self, unit: &Unit, charm: &CharmRef) -> Result<()> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match unit.set_charm(charm.as_str()).await {
                Ok(()) => {
                    debug!(charm = %charm, attempt, "charm published");
                    return Ok(());
                }
                Err(err) if err.is_transport() && attempt < attempts => {
                    warn!(charm = %charm, attempt, attempts, error = %err, "charm publication failed; retrying");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(CharmError::Commit {
                        charm: charm.clone(),
                        source,
                    })
                }
            }
        }
    }

    /// Forget the pending change. Only called once the hook following the
    /// change has been marked started.
    pub(crate) fn clear(&self) -> Result<()> {
        let Some(state) = self.record.read()? else {
            return Ok(());
        };
        if state.status == CharmStatus::Installed {
            return Ok(());
        }
        self.record.write(&CharmState {
            status: CharmStatus::Installed,
            charm: state.charm,
        })?;
        debug!("charm change cleared");
        Ok(())
    }

    /// Metrics declared by the deployed charm; `None` when it declares none.
    pub fn metrics(&self) -> Result<Option<MetricsDeclaration>> {
        let path = self.charm_dir.join(METRICS_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CharmError::Io { path, source: err }),
        };
        let declaration = MetricsDeclaration::from_yaml(&raw)
            .map_err(|source| CharmError::Metrics { path, source })?;
        Ok(Some(declaration))
    }

    fn remove_stale(&self, wanted: &HashSet<PathBuf>) -> Result<usize> {
        let mut removed = 0usize;
        let mut stale_dirs: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(&self.charm_dir).min_depth(1).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.io_error().map(|io| io.kind()) == Some(ErrorKind::NotFound) => continue,
                Err(err) => return Err(err.into()),
            };
            let Ok(relative) = entry.path().strip_prefix(&self.charm_dir) else {
                continue;
            };
            if relative.as_os_str() == CHARM_MARKER || wanted.contains(relative) {
                continue;
            }
            if entry.file_type().is_dir() {
                stale_dirs.push(entry.path().to_path_buf());
            } else {
                fs::remove_file(entry.path()).map_err(CharmError::io(entry.path()))?;
                removed += 1;
            }
        }
        for dir in stale_dirs {
            match fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(CharmError::Io { path: dir, source: err }),
            }
        }
        Ok(removed)
    }
}

fn mirror_dir(target: &Path) -> Result<bool> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => return Ok(false),
        Ok(_) => fs::remove_file(target).map_err(CharmError::io(target))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(CharmError::Io { path: target.to_path_buf(), source: err }),
    }
    fs::create_dir_all(target).map_err(CharmError::io(target))?;
    Ok(true)
}

fn mirror_symlink(source: &Path, target: &Path) -> Result<bool> {
    let link = fs::read_link(source).map_err(CharmError::io(source))?;
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(target).ok().as_deref() == Some(link.as_path()) {
                return Ok(false);
            }
            fs::remove_file(target).map_err(CharmError::io(target))?;
        }
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).map_err(CharmError::io(target))?,
        Ok(_) => fs::remove_file(target).map_err(CharmError::io(target))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(CharmError::Io { path: target.to_path_buf(), source: err }),
    }
    symlink(&link, target).map_err(CharmError::io(target))?;
    Ok(true)
}

fn mirror_file(source: &Path, target: &Path) -> Result<bool> {
    let content = fs::read(source).map_err(CharmError::io(source))?;
    let permissions = fs::metadata(source)
        .map_err(CharmError::io(source))?
        .permissions();
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_file() => {
            let same_content = fs::read(target).map(|current| current == content).unwrap_or(false);
            if same_content {
                if meta.permissions() != permissions {
                    fs::set_permissions(target, permissions).map_err(CharmError::io(target))?;
                    return Ok(true);
                }
                return Ok(false);
            }
        }
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).map_err(CharmError::io(target))?,
        Ok(_) => fs::remove_file(target).map_err(CharmError::io(target))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(CharmError::Io { path: target.to_path_buf(), source: err }),
    }
    write_atomic(target, &content, Some(permissions))?;
    Ok(true)
}

fn write_atomic(target: &Path, content: &[u8], permissions: Option<fs::Permissions>) -> Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent).map_err(CharmError::io(parent))?;
    tmp.write_all(content).map_err(CharmError::io(tmp.path()))?;
    tmp.as_file().sync_all().map_err(CharmError::io(target))?;
    if let Some(permissions) = permissions {
        fs::set_permissions(tmp.path(), permissions).map_err(CharmError::io(target))?;
    }
    tmp.persist(target)
        .map_err(|err| CharmError::Io { path: target.to_path_buf(), source: err.error })?;
    Ok(())
}
