//! ---
//! unitd_section: "02-networking-rpc"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "State service call seam, entity accessors and change watchers."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Request and response payloads exchanged with the state service.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle stage of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Life {
    /// Entity is in service.
    #[default]
    Alive,
    /// Entity should wind down.
    Dying,
    /// Entity is gone; agents must stop.
    Dead,
}

/// Operator decision about a failed hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResolvedMode {
    /// No resolution requested.
    #[default]
    None,
    /// Run the failed hook again.
    Retry,
    /// Consider the failed hook done without running it.
    NoHooks,
}

/// Agent-reported unit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UnitStatus {
    /// Agent has not reported yet.
    #[default]
    Pending,
    /// Install hook committed.
    Installed,
    /// Start hook committed.
    Started,
    /// Stop hook committed.
    Stopped,
    /// A hook failed and awaits resolution.
    Error,
}

/// Unit entity as served by `Unit.Get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDoc {
    /// `service/N`.
    pub name: String,
    /// Owning service.
    pub service: String,
    /// Charm the unit last reported as deployed.
    #[serde(default)]
    pub charm_url: Option<String>,
    /// Lifecycle stage.
    #[serde(default)]
    pub life: Life,
    /// Last status set by the agent.
    #[serde(default)]
    pub status: UnitStatus,
    /// Free-form status detail.
    #[serde(default)]
    pub status_info: String,
    /// Structured status detail, such as the failed hook.
    #[serde(default)]
    pub status_data: Option<serde_json::Value>,
    /// Pending operator resolution.
    #[serde(default)]
    pub resolved: ResolvedMode,
    /// Ports currently opened by the unit.
    #[serde(default)]
    pub ports: Vec<PortRange>,
}

impl UnitDoc {
    /// Fresh alive unit of `service`.
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            charm_url: None,
            life: Life::Alive,
            status: UnitStatus::Pending,
            status_info: String::new(),
            status_data: None,
            resolved: ResolvedMode::None,
            ports: Vec::new(),
        }
    }
}

/// Service entity as served by `Service.Get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDoc {
    /// Service name.
    pub name: String,
    /// Charm every unit of the service should run.
    pub charm_url: String,
    /// Charm configuration settings.
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Lifecycle stage.
    #[serde(default)]
    pub life: Life,
}

/// Machine entity as served by `Machine.Get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineDoc {
    /// Machine id.
    pub id: String,
    /// Provider instance, once provisioned.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Lifecycle stage.
    #[serde(default)]
    pub life: Life,
}

/// Network protocol of a port range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
}

/// Inclusive range of ports for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub from_port: u16,
    /// Last port, inclusive.
    pub to_port: u16,
    /// Protocol the range applies to.
    pub protocol: Protocol,
}

/// Rejected port range text or bounds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid port range {input:?}: {reason}")]
pub struct InvalidPortRange {
    /// Text or range that was rejected.
    pub input: String,
    /// Which rule was violated.
    pub reason: &'static str,
}

impl PortRange {
    /// Validated range.
    pub fn new(from_port: u16, to_port: u16, protocol: Protocol) -> Result<Self, InvalidPortRange> {
        let range = Self {
            from_port,
            to_port,
            protocol,
        };
        range.validate()?;
        Ok(range)
    }

    /// Ports are non-zero and ordered.
    pub fn validate(&self) -> Result<(), InvalidPortRange> {
        let invalid = |reason| InvalidPortRange {
            input: self.to_string(),
            reason,
        };
        if self.from_port == 0 || self.to_port == 0 {
            return Err(invalid("port 0 is not allowed"));
        }
        if self.from_port > self.to_port {
            return Err(invalid("range start exceeds end"));
        }
        Ok(())
    }

    /// Same protocol and at least one shared port.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.protocol == other.protocol
            && self.from_port <= other.to_port
            && other.from_port <= self.to_port
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from_port == self.to_port {
            write!(f, "{}/{}", self.from_port, self.protocol)
        } else {
            write!(f, "{}-{}/{}", self.from_port, self.to_port, self.protocol)
        }
    }
}

impl FromStr for PortRange {
    type Err = InvalidPortRange;

    /// Parses `<port>[-<to>][/<protocol>]`, defaulting to TCP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidPortRange {
            input: s.to_owned(),
            reason,
        };
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, protocol)) => (
                ports,
                protocol
                    .parse::<Protocol>()
                    .map_err(|_| invalid("protocol must be tcp or udp"))?,
            ),
            None => (s, Protocol::Tcp),
        };
        let parse_port = |raw: &str| raw.trim().parse::<u16>().map_err(|_| invalid("port must be 1-65535"));
        let (from_port, to_port) = match ports.split_once('-') {
            Some((from, to)) => (parse_port(from)?, parse_port(to)?),
            None => {
                let port = parse_port(ports)?;
                (port, port)
            }
        };
        PortRange::new(from_port, to_port, protocol).map_err(|err| invalid(err.reason))
    }
}

/// Reboot timing requested by a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RebootPriority {
    /// Reboot once the current hook has finished.
    AfterHook,
    /// Reboot immediately, interrupting the hook.
    Now,
}

/// One charm metric sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Declared metric name.
    pub key: String,
    /// Sample value as text.
    pub value: String,
    /// Sampling time.
    pub time: DateTime<Utc>,
}

/// Result of `Watch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResult {
    /// Identifier to address `Next`/`Stop` to.
    pub watcher_id: String,
}

/// Arguments of `SetPassword`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordArgs {
    /// New agent password.
    pub password: String,
}

/// Arguments of `Unit.SetCharm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCharmArgs {
    /// Deployed charm.
    pub charm_url: String,
}

/// Arguments of `Unit.SetStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusArgs {
    /// New status.
    pub status: UnitStatus,
    /// Status detail.
    #[serde(default)]
    pub info: String,
    /// Structured detail.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Arguments of `Unit.OpenPorts` and `Unit.ClosePorts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsArgs {
    /// Ranges to open or close.
    pub ports: Vec<PortRange>,
}

/// Arguments of `Unit.AddMetrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsArgs {
    /// Samples recorded by one hook.
    pub metrics: Vec<Metric>,
}

/// Arguments of `Unit.RequestReboot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebootArgs {
    /// Requested timing.
    pub priority: RebootPriority,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_ranges() {
        let single: PortRange = "80".parse().unwrap();
        assert_eq!(single, PortRange::new(80, 80, Protocol::Tcp).unwrap());
        let range: PortRange = "8000-8010/udp".parse().unwrap();
        assert_eq!(range, PortRange::new(8000, 8010, Protocol::Udp).unwrap());
        assert_eq!(range.to_string(), "8000-8010/udp");
        assert_eq!(single.to_string(), "80/tcp");
    }

    #[test]
    fn rejects_bad_port_ranges() {
        for input in ["0", "90-80", "80/icmp", "http", "70000", "1-"] {
            assert!(input.parse::<PortRange>().is_err(), "{input} accepted");
        }
    }

    #[test]
    fn overlap_requires_same_protocol() {
        let tcp = PortRange::new(8000, 8010, Protocol::Tcp).unwrap();
        let inner = PortRange::new(8010, 8020, Protocol::Tcp).unwrap();
        let udp = PortRange::new(8000, 8010, Protocol::Udp).unwrap();
        let apart = PortRange::new(9000, 9000, Protocol::Tcp).unwrap();
        assert!(tcp.overlaps(&inner));
        assert!(!tcp.overlaps(&udp));
        assert!(!tcp.overlaps(&apart));
    }

    #[test]
    fn unit_doc_defaults_from_sparse_json() {
        let doc: UnitDoc =
            serde_json::from_value(serde_json::json!({"name": "wp/0", "service": "wp"})).unwrap();
        assert_eq!(doc.life, Life::Alive);
        assert_eq!(doc.resolved, ResolvedMode::None);
        assert!(doc.charm_url.is_none());
    }
}
