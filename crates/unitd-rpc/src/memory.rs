//! ---
//! unitd_section: "02-networking-rpc"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "State service call seam, entity accessors and change watchers."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! In-process state service.
//!
//! Every entity carries a revision that only moves when its document actually
//! changes. A watcher remembers the revision it last reported, so `Next`
//! returns once per burst of changes and never for a write that changed
//! nothing.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::params::{
    Life, MachineDoc, Metric, MetricsArgs, PasswordArgs, PortsArgs, RebootArgs, RebootPriority,
    ResolvedMode, ServiceDoc, SetCharmArgs, SetStatusArgs, UnitDoc, WatchResult,
};
use crate::{
    ErrorCode, Result, RpcCaller, RpcError, MACHINE_FACADE, SERVICE_FACADE, UNIT_FACADE,
    WATCHER_FACADE,
};

/// Initial contents of an [`InMemoryState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSeed {
    /// Services to create.
    #[serde(default)]
    pub services: Vec<ServiceDoc>,
    /// Units to create.
    #[serde(default)]
    pub units: Vec<UnitDoc>,
    /// Machines to create.
    #[serde(default)]
    pub machines: Vec<MachineDoc>,
}

impl StateSeed {
    /// Parse a JSON seed document.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntityKey {
    Unit(String),
    Service(String),
    Machine(String),
}

impl EntityKey {
    fn resolve(facade: &str, id: &str) -> Result<Self> {
        match facade {
            UNIT_FACADE => Ok(EntityKey::Unit(id.to_owned())),
            SERVICE_FACADE => Ok(EntityKey::Service(id.to_owned())),
            MACHINE_FACADE => Ok(EntityKey::Machine(id.to_owned())),
            other => Err(RpcError::server(
                ErrorCode::NotImplemented,
                format!("unknown facade {other}"),
            )),
        }
    }
}

#[derive(Debug)]
struct Entry<T> {
    doc: T,
    revision: watch::Sender<u64>,
}

impl<T: Clone + PartialEq> Entry<T> {
    fn new(doc: T) -> Self {
        let (revision, _) = watch::channel(0);
        Self { doc, revision }
    }

    /// Apply `change`, bumping the revision only if the document differs.
    fn update(&mut self, change: impl FnOnce(&mut T)) -> bool {
        let before = self.doc.clone();
        change(&mut self.doc);
        let changed = self.doc != before;
        if changed {
            self.revision.send_modify(|revision| *revision += 1);
        }
        changed
    }
}

#[derive(Debug)]
struct WatcherEntry {
    entity: EntityKey,
    seen: u64,
    stop: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Inner {
    units: HashMap<String, Entry<UnitDoc>>,
    services: HashMap<String, Entry<ServiceDoc>>,
    machines: HashMap<String, Entry<MachineDoc>>,
    watchers: HashMap<String, WatcherEntry>,
    next_watcher: u64,
    stop_calls: HashMap<String, u32>,
    calls: HashMap<(String, String), u32>,
    faults: HashMap<String, u32>,
    passwords: HashMap<String, String>,
    metrics: HashMap<String, Vec<Metric>>,
    reboots: HashMap<String, RebootPriority>,
}

impl Inner {
    fn revision(&self, key: &EntityKey) -> Option<&watch::Sender<u64>> {
        match key {
            EntityKey::Unit(name) => self.units.get(name).map(|entry| &entry.revision),
            EntityKey::Service(name) => self.services.get(name).map(|entry| &entry.revision),
            EntityKey::Machine(id) => self.machines.get(id).map(|entry| &entry.revision),
        }
    }

    fn unit_mut(&mut self, name: &str) -> Result<&mut Entry<UnitDoc>> {
        self.units
            .get_mut(name)
            .ok_or_else(|| not_found("unit", name))
    }

    fn service_mut(&mut self, name: &str) -> Result<&mut Entry<ServiceDoc>> {
        self.services
            .get_mut(name)
            .ok_or_else(|| not_found("service", name))
    }
}

fn not_found(kind: &str, id: &str) -> RpcError {
    RpcError::server(ErrorCode::NotFound, format!("{kind} {id:?} not found"))
}

fn decode<T: DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(RpcError::from)
}

/// State service kept entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryState {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryState {
    /// Empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Service pre-populated from `seed`.
    pub fn from_seed(seed: StateSeed) -> Self {
        let state = Self::new();
        for service in seed.services {
            state.add_service(service);
        }
        for unit in seed.units {
            state.add_unit(unit);
        }
        for machine in seed.machines {
            state.add_machine(machine);
        }
        let (units, services) = {
            let inner = state.inner.lock();
            (inner.units.len(), inner.services.len())
        };
        info!(units, services, "in-memory state seeded");
        state
    }

    /// Create or replace a service.
    pub fn add_service(&self, doc: ServiceDoc) {
        self.inner
            .lock()
            .services
            .insert(doc.name.clone(), Entry::new(doc));
    }

    /// Create or replace a unit.
    pub fn add_unit(&self, doc: UnitDoc) {
        self.inner
            .lock()
            .units
            .insert(doc.name.clone(), Entry::new(doc));
    }

    /// Create or replace a machine.
    pub fn add_machine(&self, doc: MachineDoc) {
        self.inner
            .lock()
            .machines
            .insert(doc.id.clone(), Entry::new(doc));
    }

    /// Replace a service's configuration. Returns whether anything changed.
    pub fn update_config(&self, service: &str, config: BTreeMap<String, Value>) -> bool {
        self.modify_service(service, |doc| doc.config = config)
    }

    /// Point a service at a new charm.
    pub fn set_service_charm(&self, service: &str, charm_url: &str) -> bool {
        self.modify_service(service, |doc| doc.charm_url = charm_url.to_owned())
    }

    /// Move a unit through its lifecycle.
    pub fn set_unit_life(&self, unit: &str, life: Life) -> bool {
        self.modify_unit(unit, |doc| doc.life = life)
    }

    /// Record an operator resolution for a failed hook.
    pub fn resolve(&self, unit: &str, mode: ResolvedMode) -> bool {
        self.modify_unit(unit, |doc| doc.resolved = mode)
    }

    /// Current unit document.
    pub fn unit(&self, name: &str) -> Option<UnitDoc> {
        self.inner.lock().units.get(name).map(|entry| entry.doc.clone())
    }

    /// Current service document.
    pub fn service(&self, name: &str) -> Option<ServiceDoc> {
        self.inner
            .lock()
            .services
            .get(name)
            .map(|entry| entry.doc.clone())
    }

    /// End a watcher from the server side, as a shutting down server would.
    pub fn kill_watcher(&self, watcher_id: &str) -> bool {
        match self.inner.lock().watchers.remove(watcher_id) {
            Some(entry) => {
                entry.stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Ids of registered watchers.
    pub fn watcher_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().watchers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `Stop` calls received for one watcher.
    pub fn stop_calls(&self, watcher_id: &str) -> u32 {
        self.inner
            .lock()
            .stop_calls
            .get(watcher_id)
            .copied()
            .unwrap_or_default()
    }

    /// Calls received for `facade.method`, including failed ones.
    pub fn call_count(&self, facade: &str, method: &str) -> u32 {
        self.inner
            .lock()
            .calls
            .get(&(facade.to_owned(), method.to_owned()))
            .copied()
            .unwrap_or_default()
    }

    /// Fail the next `times` calls of `method` with a transport error.
    pub fn fail_next(&self, method: &str, times: u32) {
        self.inner.lock().faults.insert(method.to_owned(), times);
    }

    /// Metric samples published for a unit.
    pub fn metrics(&self, unit: &str) -> Vec<Metric> {
        self.inner
            .lock()
            .metrics
            .get(unit)
            .cloned()
            .unwrap_or_default()
    }

    /// Last reboot request published for a unit.
    pub fn reboot_request(&self, unit: &str) -> Option<RebootPriority> {
        self.inner.lock().reboots.get(unit).copied()
    }

    /// Password last set for an entity.
    pub fn password(&self, facade: &str, id: &str) -> Option<String> {
        self.inner
            .lock()
            .passwords
            .get(&format!("{facade}:{id}"))
            .cloned()
    }

    fn modify_unit(&self, name: &str, change: impl FnOnce(&mut UnitDoc)) -> bool {
        match self.inner.lock().units.get_mut(name) {
            Some(entry) => entry.update(change),
            None => false,
        }
    }

    fn modify_service(&self, name: &str, change: impl FnOnce(&mut ServiceDoc)) -> bool {
        match self.inner.lock().services.get_mut(name) {
            Some(entry) => entry.update(change),
            None => false,
        }
    }

    fn register_watcher(&self, facade: &str, id: &str) -> Result<Value> {
        let key = EntityKey::resolve(facade, id)?;
        let mut inner = self.inner.lock();
        let seen = match inner.revision(&key) {
            Some(revision) => *revision.borrow(),
            None => return Err(not_found(facade, id)),
        };
        inner.next_watcher += 1;
        let watcher_id = inner.next_watcher.to_string();
        let (stop, _) = watch::channel(false);
        inner.watchers.insert(
            watcher_id.clone(),
            WatcherEntry {
                entity: key,
                seen,
                stop,
            },
        );
        debug!(facade, id, watcher = %watcher_id, "watcher registered");
        Ok(serde_json::to_value(WatchResult { watcher_id })?)
    }

    fn stop_watcher(&self, watcher_id: &str) -> Result<Value> {
        let mut inner = self.inner.lock();
        *inner.stop_calls.entry(watcher_id.to_owned()).or_default() += 1;
        match inner.watchers.remove(watcher_id) {
            Some(entry) => {
                entry.stop.send_replace(true);
                debug!(watcher = %watcher_id, "watcher removed");
                Ok(Value::Null)
            }
            None => Err(not_found("watcher", watcher_id)),
        }
    }

    async fn next(&self, watcher_id: &str) -> Result<Value> {
        let (mut revision, seen, mut stop) = {
            let inner = self.inner.lock();
            let entry = inner
                .watchers
                .get(watcher_id)
                .ok_or_else(|| not_found("watcher", watcher_id))?;
            let revision = inner
                .revision(&entry.entity)
                .ok_or_else(|| not_found("entity for watcher", watcher_id))?
                .subscribe();
            (revision, entry.seen, entry.stop.subscribe())
        };

        let changed = async {
            revision
                .wait_for(|current| *current > seen)
                .await
                .map(|current| *current)
        };
        let stopped = async {
            let _ = stop.wait_for(|stopped| *stopped).await;
        };
        tokio::select! {
            current = changed => {
                let current = current.map_err(|_| not_found("entity for watcher", watcher_id))?;
                if let Some(entry) = self.inner.lock().watchers.get_mut(watcher_id) {
                    entry.seen = current;
                }
                Ok(Value::Null)
            }
            _ = stopped => {
                Err(RpcError::server(ErrorCode::Stopped, format!("watcher {watcher_id} stopped")))
            }
        }
    }

    fn handle(&self, facade: &str, id: &str, method: &str, args: Value) -> Result<Value> {
        if method == "Watch" {
            return self.register_watcher(facade, id);
        }
        match (facade, method) {
            (WATCHER_FACADE, "Stop") => self.stop_watcher(id),
            (UNIT_FACADE, "Get") => {
                let inner = self.inner.lock();
                let entry = inner.units.get(id).ok_or_else(|| not_found("unit", id))?;
                Ok(serde_json::to_value(&entry.doc)?)
            }
            (SERVICE_FACADE, "Get") => {
                let inner = self.inner.lock();
                let entry = inner
                    .services
                    .get(id)
                    .ok_or_else(|| not_found("service", id))?;
                Ok(serde_json::to_value(&entry.doc)?)
            }
            (MACHINE_FACADE, "Get") => {
                let inner = self.inner.lock();
                let entry = inner
                    .machines
                    .get(id)
                    .ok_or_else(|| not_found("machine", id))?;
                Ok(serde_json::to_value(&entry.doc)?)
            }
            (UNIT_FACADE | MACHINE_FACADE, "SetPassword") => {
                let PasswordArgs { password } = decode(args)?;
                let mut inner = self.inner.lock();
                let known = match facade {
                    UNIT_FACADE => inner.units.contains_key(id),
                    _ => inner.machines.contains_key(id),
                };
                if !known {
                    return Err(not_found(facade, id));
                }
                inner.passwords.insert(format!("{facade}:{id}"), password);
                Ok(Value::Null)
            }
            (UNIT_FACADE, "SetCharm") => {
                let SetCharmArgs { charm_url } = decode(args)?;
                self.inner
                    .lock()
                    .unit_mut(id)?
                    .update(|doc| doc.charm_url = Some(charm_url));
                Ok(Value::Null)
            }
            (UNIT_FACADE, "SetStatus") => {
                let SetStatusArgs { status, info, data } = decode(args)?;
                self.inner.lock().unit_mut(id)?.update(|doc| {
                    doc.status = status;
                    doc.status_info = info;
                    doc.status_data = data;
                });
                Ok(Value::Null)
            }
            (UNIT_FACADE, "ClearResolved") => {
                self.inner
                    .lock()
                    .unit_mut(id)?
                    .update(|doc| doc.resolved = ResolvedMode::None);
                Ok(Value::Null)
            }
            (UNIT_FACADE, "OpenPorts") => {
                let PortsArgs { ports } = decode(args)?;
                self.inner.lock().unit_mut(id)?.update(|doc| {
                    for port in ports {
                        if !doc.ports.contains(&port) {
                            doc.ports.push(port);
                        }
                    }
                    doc.ports.sort();
                });
                Ok(Value::Null)
            }
            (UNIT_FACADE, "ClosePorts") => {
                let PortsArgs { ports } = decode(args)?;
                self.inner
                    .lock()
                    .unit_mut(id)?
                    .update(|doc| doc.ports.retain(|open| !ports.contains(open)));
                Ok(Value::Null)
            }
            (UNIT_FACADE, "AddMetrics") => {
                let MetricsArgs { metrics } = decode(args)?;
                let mut inner = self.inner.lock();
                inner.unit_mut(id)?;
                inner.metrics.entry(id.to_owned()).or_default().extend(metrics);
                Ok(Value::Null)
            }
            (UNIT_FACADE, "RequestReboot") => {
                let RebootArgs { priority } = decode(args)?;
                let mut inner = self.inner.lock();
                inner.unit_mut(id)?;
                inner.reboots.insert(id.to_owned(), priority);
                Ok(Value::Null)
            }
            (SERVICE_FACADE, "SetConfig") => {
                let config: BTreeMap<String, Value> = decode(args)?;
                self.inner
                    .lock()
                    .service_mut(id)?
                    .update(|doc| doc.config = config);
                Ok(Value::Null)
            }
            _ => Err(RpcError::server(
                ErrorCode::NotImplemented,
                format!("{facade}.{method} is not served"),
            )),
        }
    }
}

#[async_trait]
impl RpcCaller for InMemoryState {
    async fn call(&self, facade: &str, id: &str, method: &str, args: Value) -> Result<Value> {
        {
            let mut inner = self.inner.lock();
            *inner
                .calls
                .entry((facade.to_owned(), method.to_owned()))
                .or_default() += 1;
            if let Some(remaining) = inner.faults.get_mut(method) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RpcError::Transport(format!(
                        "injected failure for {facade}.{method}"
                    )));
                }
            }
        }
        if facade == WATCHER_FACADE && method == "Next" {
            return self.next(id).await;
        }
        self.handle(facade, id, method, args)
    }
}
