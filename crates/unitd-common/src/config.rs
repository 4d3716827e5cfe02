//! ---
//! unitd_section: "01-core-functionality"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Shared primitives and utilities for the unit agent."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/unitd")
}

fn default_charm_repository() -> PathBuf {
    PathBuf::from("/var/lib/unitd/charms")
}

fn default_hook_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_commit_attempts() -> u32 {
    5
}

fn default_commit_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9797))
}

/// Primary configuration object for the unit agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub unit_name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_charm_repository")]
    pub charm_repository: PathBuf,
    /// Agent password pushed to the state service on startup when present.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub hooks: HookConfig,
    #[serde(default)]
    pub commit_retry: CommitRetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub state: StateConfig,
}

/// Metadata describing where an [`AgentConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAgentConfig {
    pub config: AgentConfig,
    pub source: PathBuf,
}

impl AgentConfig {
    pub const ENV_CONFIG_PATH: &'static str = "UNITD_CONFIG";

    /// Load configuration from disk, respecting the `UNITD_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAgentConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAgentConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AgentConfig>()
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        validate_unit_name(&self.unit_name)?;
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data_dir must not be empty"));
        }
        if self.commit_retry.attempts == 0 {
            return Err(anyhow!("commit_retry.attempts must be at least 1"));
        }
        Ok(())
    }

    /// Extract the explicit engine configuration.
    pub fn uniter(&self) -> UniterConfig {
        UniterConfig {
            unit_name: self.unit_name.clone(),
            data_dir: self.data_dir.clone(),
            charm_repository: self.charm_repository.clone(),
            hook_timeout: self.hooks.timeout,
            commit_retry: self.commit_retry.clone(),
        }
    }
}

impl std::str::FromStr for AgentConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AgentConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_unit_name(name: &str) -> Result<()> {
    let Some((service, number)) = name.split_once('/') else {
        return Err(anyhow!("unit name {name:?} must have the form <service>/<number>"));
    };
    if service.is_empty() || number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!("unit name {name:?} must have the form <service>/<number>"));
    }
    Ok(())
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Upper bound on a single hook execution; the process is killed past it.
    #[serde(default = "default_hook_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            timeout: default_hook_timeout(),
        }
    }
}

/// Retry policy for publishing a deployed charm reference to the state service.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitRetryConfig {
    #[serde(default = "default_commit_attempts")]
    pub attempts: u32,
    #[serde(default = "default_commit_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub delay: Duration,
}

impl Default for CommitRetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_commit_attempts(),
            delay: default_commit_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Local state backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// JSON document used to seed the in-process state service.
    #[serde(default)]
    pub seed: Option<PathBuf>,
}

/// Explicit configuration handed to the uniter engine at construction.
#[derive(Debug, Clone)]
pub struct UniterConfig {
    pub unit_name: String,
    pub data_dir: PathBuf,
    pub charm_repository: PathBuf,
    pub hook_timeout: Duration,
    pub commit_retry: CommitRetryConfig,
}

impl UniterConfig {
    /// Minimal configuration rooted at `data_dir`, mostly useful in tests.
    pub fn new(
        unit_name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        charm_repository: impl Into<PathBuf>,
    ) -> Self {
        Self {
            unit_name: unit_name.into(),
            data_dir: data_dir.into(),
            charm_repository: charm_repository.into(),
            hook_timeout: default_hook_timeout(),
            commit_retry: CommitRetryConfig::default(),
        }
    }

    pub fn paths(&self) -> UnitPaths {
        UnitPaths::new(&self.data_dir, &self.unit_name)
    }
}

/// Filesystem layout owned by a single unit agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub hook_state: PathBuf,
    pub charm_state: PathBuf,
    pub charm_dir: PathBuf,
    pub socket: PathBuf,
}

impl UnitPaths {
    /// Derive the layout for `unit_name` under `data_dir`.
    pub fn new(data_dir: &Path, unit_name: &str) -> Self {
        let root = data_dir.join("units").join(unit_name.replacen('/', "-", 1));
        let state_dir = root.join("state");
        Self {
            hook_state: state_dir.join("hook"),
            charm_state: state_dir.join("charm"),
            charm_dir: root.join("charm"),
            socket: root.join("agent.socket"),
            state_dir,
            root,
        }
    }

    /// Ensure the directories the agent writes into exist.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("unable to create state dir {}", self.state_dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: AgentConfig = r#"
            unit_name = "wordpress/0"
            data_dir = "/tmp/unitd"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.hooks.timeout, Duration::from_secs(300));
        assert_eq!(config.commit_retry.attempts, 5);
        assert!(!config.metrics.enabled);
        assert!(config.state.seed.is_none());
    }

    #[test]
    fn rejects_malformed_unit_names() {
        for name in ["wordpress", "wordpress/", "/0", "wordpress/x"] {
            let raw = format!("unit_name = {name:?}");
            assert!(raw.parse::<AgentConfig>().is_err(), "{name} accepted");
        }
    }

    #[test]
    fn unit_paths_are_derived_from_data_dir() {
        let paths = UnitPaths::new(Path::new("/srv/agent"), "mysql/12");
        assert_eq!(paths.root, PathBuf::from("/srv/agent/units/mysql-12"));
        assert_eq!(paths.hook_state, PathBuf::from("/srv/agent/units/mysql-12/state/hook"));
        assert_eq!(paths.charm_dir, PathBuf::from("/srv/agent/units/mysql-12/charm"));
        assert_eq!(paths.socket, PathBuf::from("/srv/agent/units/mysql-12/agent.socket"));
    }

    #[test]
    fn durations_parse_from_config() {
        let config: AgentConfig = r#"
            unit_name = "wordpress/0"

            [hooks]
            timeout = 30

            [commit_retry]
            attempts = 3
            delay = 250
        "#
        .parse()
        .unwrap();
        let uniter = config.uniter();
        assert_eq!(uniter.hook_timeout, Duration::from_secs(30));
        assert_eq!(uniter.commit_retry.delay, Duration::from_millis(250));
    }
}
