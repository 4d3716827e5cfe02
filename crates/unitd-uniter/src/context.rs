//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Capabilities handed to one hook invocation.
use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use unitd_persistence::HookInfo;
use unitd_rpc::{Metric, PortRange, RebootPriority, UnitDoc};

use crate::charm::MetricsDeclaration;
use crate::error::ContextError;

/// Metric names starting with this prefix are reserved for the agent.
pub const RESERVED_METRIC_PREFIX: &str = "unitd-";

/// Digest identifying a configuration snapshot.
pub fn config_digest(config: &BTreeMap<String, Value>) -> String {
    // BTreeMap keys serialize in order, so equal maps give equal bytes.
    let bytes = serde_json::to_vec(config).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

/// Side effects a hook queued; applied by the engine only if the hook succeeds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextOutcome {
    pub metrics: Vec<Metric>,
    pub reboot: Option<RebootPriority>,
    pub open: Vec<PortRange>,
    pub close: Vec<PortRange>,
}

impl ContextOutcome {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.reboot.is_none() && self.open.is_empty() && self.close.is_empty()
    }
}

/// Per-invocation state behind the hook tools.
///
/// The configuration is a snapshot taken when the hook starts and does not
/// move while the hook runs.
#[derive(Debug)]
pub struct HookContext {
    id: String,
    unit_name: String,
    service_name: String,
    charm_url: Option<String>,
    hook: HookInfo,
    config: BTreeMap<String, Value>,
    config_digest: String,
    declared_metrics: Option<MetricsDeclaration>,
    metrics: Vec<Metric>,
    reboot: Option<RebootPriority>,
    opened: Vec<PortRange>,
    pending_open: Vec<PortRange>,
    pending_close: Vec<PortRange>,
}

impl HookContext {
    pub fn new(
        unit: &UnitDoc,
        hook: HookInfo,
        config: BTreeMap<String, Value>,
        declared_metrics: Option<MetricsDeclaration>,
    ) -> Self {
        let id = format!("{}:{}:{}", unit.name, hook.kind, rand::random::<u64>());
        let config_digest = config_digest(&config);
        Self {
            id,
            unit_name: unit.name.clone(),
            service_name: unit.service.clone(),
            charm_url: unit.charm_url.clone(),
            hook,
            config,
            config_digest,
            declared_metrics,
            metrics: Vec::new(),
            reboot: None,
            opened: unit.ports.clone(),
            pending_open: Vec::new(),
            pending_close: Vec::new(),
        }
    }

    /// Opaque identifier a tool request must present.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hook(&self) -> &HookInfo {
        &self.hook
    }

    pub fn config_digest(&self) -> &str {
        &self.config_digest
    }

    pub fn check_id(&self, got: &str) -> Result<(), ContextError> {
        if got == self.id {
            Ok(())
        } else {
            Err(ContextError::Auth {
                expected: self.id.clone(),
                got: got.to_owned(),
            })
        }
    }

    /// Whole snapshot as an object, or a single key (`null` when unset).
    pub fn config(&self, key: Option<&str>) -> Value {
        match key {
            Some(key) => self.config.get(key).cloned().unwrap_or(Value::Null),
            None => Value::Object(
                self.config
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
        }
    }

    /// Queue metric samples. Either every sample is accepted or none is.
    pub fn add_metrics(&mut self, samples: &[(String, String)]) -> Result<(), ContextError> {
        let declared = self
            .declared_metrics
            .as_ref()
            .filter(|declared| !declared.metrics.is_empty())
            .ok_or(ContextError::MetricsDisabled)?;
        let now = Utc::now();
        let mut accepted = Vec::with_capacity(samples.len());
        for (key, value) in samples {
            if key.starts_with(RESERVED_METRIC_PREFIX) {
                return Err(ContextError::ReservedMetric(key.clone()));
            }
            let spec = declared
                .get(key)
                .ok_or_else(|| ContextError::UndeclaredMetric(key.clone()))?;
            spec.kind
                .check(value)
                .map_err(|reason| ContextError::InvalidMetricValue {
                    key: key.clone(),
                    value: value.clone(),
                    reason,
                })?;
            accepted.push(Metric {
                key: key.clone(),
                value: value.clone(),
                time: now,
            });
        }
        self.metrics.extend(accepted);
        Ok(())
    }

    /// Last request within a hook wins.
    pub fn request_reboot(&mut self, priority: RebootPriority) {
        self.reboot = Some(priority);
    }

    pub fn open_port(&mut self, range: PortRange) -> Result<(), ContextError> {
        range.validate()?;
        if self.pending_open.contains(&range) {
            return Ok(());
        }
        if let Some(pos) = self.pending_close.iter().position(|closing| *closing == range) {
            self.pending_close.remove(pos);
            return Ok(());
        }
        if self.opened.contains(&range) {
            return Ok(());
        }
        if let Some(existing) = self.effective().find(|open| open.overlaps(&range)) {
            return Err(ContextError::PortRangeConflict {
                requested: range,
                existing,
            });
        }
        self.pending_open.push(range);
        Ok(())
    }

    pub fn close_port(&mut self, range: PortRange) -> Result<(), ContextError> {
        range.validate()?;
        if let Some(pos) = self.pending_open.iter().position(|opening| *opening == range) {
            self.pending_open.remove(pos);
            return Ok(());
        }
        if self.pending_close.contains(&range) {
            return Ok(());
        }
        if self.opened.contains(&range) {
            self.pending_close.push(range);
            return Ok(());
        }
        if let Some(existing) = self.effective().find(|open| open.overlaps(&range)) {
            return Err(ContextError::PortRangeConflict {
                requested: range,
                existing,
            });
        }
        Ok(())
    }

    /// Ranges that will be open once the queued changes are applied.
    pub fn opened_ports(&self) -> Vec<PortRange> {
        let mut ports: Vec<PortRange> = self.effective().collect();
        ports.sort();
        ports
    }

    pub fn unit_get(&self, key: &str) -> Result<String, ContextError> {
        match key {
            "name" => Ok(self.unit_name.clone()),
            "service" => Ok(self.service_name.clone()),
            "charm-url" => Ok(self.charm_url.clone().unwrap_or_default()),
            other => Err(ContextError::arguments(
                "unit-get",
                format!("unknown setting {other:?}"),
            )),
        }
    }

    /// Drain the queued side effects.
    pub fn take_outcome(&mut self) -> ContextOutcome {
        ContextOutcome {
            metrics: std::mem::take(&mut self.metrics),
            reboot: self.reboot.take(),
            open: std::mem::take(&mut self.pending_open),
            close: std::mem::take(&mut self.pending_close),
        }
    }

    fn effective(&self) -> impl Iterator<Item = PortRange> + '_ {
        self.opened
            .iter()
            .filter(|open| !self.pending_close.contains(open))
            .chain(self.pending_open.iter())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitd_persistence::HookKind;
    use unitd_rpc::Protocol;

    fn declaration(yaml: &str) -> MetricsDeclaration {
        MetricsDeclaration::from_yaml(yaml).unwrap()
    }

    fn context(metrics: Option<MetricsDeclaration>) -> HookContext {
        let mut unit = UnitDoc::new("wordpress/0", "wordpress");
        unit.ports = vec!["80/tcp".parse().unwrap()];
        let config = BTreeMap::from([("title".to_owned(), Value::from("blog"))]);
        HookContext::new(&unit, HookInfo::new(HookKind::Start), config, metrics)
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn ids_are_unique_and_checked() {
        let a = context(None);
        let b = context(None);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("wordpress/0:start:"));
        assert!(a.check_id(a.id()).is_ok());
        assert!(matches!(a.check_id(b.id()), Err(ContextError::Auth { .. })));
    }

    #[test]
    fn metrics_require_a_declaration() {
        let mut ctx = context(None);
        assert_eq!(
            ctx.add_metrics(&pairs(&[("pings", "1")])),
            Err(ContextError::MetricsDisabled)
        );
    }

    #[test]
    fn metric_batches_are_all_or_nothing() {
        let mut ctx = context(Some(declaration(
            "metrics:\n  pings:\n    type: absolute\n  load:\n    type: gauge\n",
        )));
        ctx.add_metrics(&pairs(&[("pings", "3"), ("load", "-0.5")])).unwrap();
        assert!(matches!(
            ctx.add_metrics(&pairs(&[("load", "1"), ("pings", "-1")])),
            Err(ContextError::InvalidMetricValue { .. })
        ));
        assert!(matches!(
            ctx.add_metrics(&pairs(&[("users", "1")])),
            Err(ContextError::UndeclaredMetric(_))
        ));
        assert!(matches!(
            ctx.add_metrics(&pairs(&[("unitd-units", "1")])),
            Err(ContextError::ReservedMetric(_))
        ));
        assert_eq!(ctx.take_outcome().metrics.len(), 2);
    }

    #[test]
    fn last_reboot_request_wins() {
        let mut ctx = context(None);
        ctx.request_reboot(RebootPriority::Now);
        ctx.request_reboot(RebootPriority::AfterHook);
        assert_eq!(ctx.take_outcome().reboot, Some(RebootPriority::AfterHook));
    }

    #[test]
    fn overlapping_port_ranges_are_rejected() {
        let mut ctx = context(None);
        let conflict = ctx.open_port("79-81/tcp".parse().unwrap()).unwrap_err();
        assert!(matches!(conflict, ContextError::PortRangeConflict { .. }));

        // Same ports on another protocol do not overlap.
        ctx.open_port(PortRange::new(80, 80, Protocol::Udp).unwrap()).unwrap();
        ctx.open_port("8000-8010/tcp".parse().unwrap()).unwrap();
        assert!(ctx.open_port("8005/tcp".parse().unwrap()).is_err());
        assert!(ctx.close_port("8005/tcp".parse().unwrap()).is_err());

        ctx.close_port("80/tcp".parse().unwrap()).unwrap();
        ctx.open_port("79-81/tcp".parse().unwrap()).unwrap();
        assert_eq!(
            ctx.opened_ports()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["79-81/tcp", "80/udp", "8000-8010/tcp"]
        );

        let outcome = ctx.take_outcome();
        assert_eq!(outcome.close, vec!["80/tcp".parse::<PortRange>().unwrap()]);
        assert_eq!(outcome.open.len(), 3);
    }

    #[test]
    fn reopening_a_closed_range_cancels_the_close() {
        let mut ctx = context(None);
        ctx.close_port("80/tcp".parse().unwrap()).unwrap();
        ctx.open_port("80/tcp".parse().unwrap()).unwrap();
        assert!(ctx.take_outcome().is_empty());
    }

    #[test]
    fn config_snapshot_and_unit_settings() {
        let ctx = context(None);
        assert_eq!(ctx.config(Some("title")), Value::from("blog"));
        assert_eq!(ctx.config(Some("missing")), Value::Null);
        assert_eq!(ctx.config(None)["title"], Value::from("blog"));
        assert_eq!(ctx.unit_get("service").unwrap(), "wordpress");
        assert!(ctx.unit_get("public-address").is_err());
    }

    #[test]
    fn digest_tracks_content() {
        let a = BTreeMap::from([("x".to_owned(), Value::from(1))]);
        let b = BTreeMap::from([("x".to_owned(), Value::from(2))]);
        assert_eq!(config_digest(&a), config_digest(&a.clone()));
        assert_ne!(config_digest(&a), config_digest(&b));
    }
}
