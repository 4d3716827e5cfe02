//! ---
//! unitd_section: "02-networking-rpc"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "State service call seam, entity accessors and change watchers."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Typed accessors over the raw call primitive.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::params::{
    Life, MachineDoc, Metric, MetricsArgs, PasswordArgs, PortRange, PortsArgs, RebootArgs,
    RebootPriority, ResolvedMode, ServiceDoc, SetCharmArgs, SetStatusArgs, UnitDoc, UnitStatus,
};
use crate::watcher::EntityWatcher;
use crate::{Result, RpcCaller, MACHINE_FACADE, SERVICE_FACADE, UNIT_FACADE};

/// Entry point to the state service.
#[derive(Clone)]
pub struct StateClient {
    caller: Arc<dyn RpcCaller>,
}

impl std::fmt::Debug for StateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateClient").finish_non_exhaustive()
    }
}

impl StateClient {
    /// Client issuing every request through `caller`.
    pub fn new(caller: Arc<dyn RpcCaller>) -> Self {
        Self { caller }
    }

    /// Underlying call primitive.
    pub fn caller(&self) -> Arc<dyn RpcCaller> {
        self.caller.clone()
    }

    /// Fetch the named unit.
    pub async fn unit(&self, name: &str) -> Result<Unit> {
        let doc = self.get(UNIT_FACADE, name).await?;
        Ok(Unit {
            client: self.clone(),
            doc,
        })
    }

    /// Fetch the named service.
    pub async fn service(&self, name: &str) -> Result<Service> {
        let doc = self.get(SERVICE_FACADE, name).await?;
        Ok(Service {
            client: self.clone(),
            doc,
        })
    }

    /// Fetch the machine with `id`.
    pub async fn machine(&self, id: &str) -> Result<Machine> {
        let doc = self.get(MACHINE_FACADE, id).await?;
        Ok(Machine {
            client: self.clone(),
            doc,
        })
    }

    async fn get<T: DeserializeOwned>(&self, facade: &str, id: &str) -> Result<T> {
        self.request(facade, id, "Get", Value::Null).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        facade: &str,
        id: &str,
        method: &str,
        args: Value,
    ) -> Result<T> {
        let response = self.caller.call(facade, id, method, args).await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn send<A: Serialize>(&self, facade: &str, id: &str, method: &str, args: &A) -> Result<()> {
        self.caller
            .call(facade, id, method, serde_json::to_value(args)?)
            .await?;
        Ok(())
    }

    async fn watch(&self, facade: &str, id: &str) -> Result<EntityWatcher> {
        EntityWatcher::watch(self.caller.clone(), facade, id).await
    }
}

/// Cached view of a unit entity.
#[derive(Debug, Clone)]
pub struct Unit {
    client: StateClient,
    doc: UnitDoc,
}

impl Unit {
    /// `service/N`.
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    /// Owning service.
    pub fn service_name(&self) -> &str {
        &self.doc.service
    }

    /// Cached document.
    pub fn doc(&self) -> &UnitDoc {
        &self.doc
    }

    /// Lifecycle stage as of the last refresh.
    pub fn life(&self) -> Life {
        self.doc.life
    }

    /// Pending operator resolution as of the last refresh.
    pub fn resolved(&self) -> ResolvedMode {
        self.doc.resolved
    }

    /// Charm the unit last reported.
    pub fn charm_url(&self) -> Option<&str> {
        self.doc.charm_url.as_deref()
    }

    /// Re-read the document.
    pub async fn refresh(&mut self) -> Result<()> {
        self.doc = self.client.get(UNIT_FACADE, &self.doc.name).await?;
        Ok(())
    }

    /// Set the unit agent's password.
    pub async fn set_password(&self, password: &str) -> Result<()> {
        let args = PasswordArgs {
            password: password.to_owned(),
        };
        self.client.send(UNIT_FACADE, self.name(), "SetPassword", &args).await
    }

    /// Watch the unit for changes.
    pub async fn watch(&self) -> Result<EntityWatcher> {
        self.client.watch(UNIT_FACADE, self.name()).await
    }

    /// Record the charm now deployed by the unit.
    pub async fn set_charm(&self, charm_url: &str) -> Result<()> {
        let args = SetCharmArgs {
            charm_url: charm_url.to_owned(),
        };
        self.client.send(UNIT_FACADE, self.name(), "SetCharm", &args).await
    }

    /// Report agent status.
    pub async fn set_status(&self, status: UnitStatus, info: &str, data: Option<Value>) -> Result<()> {
        let args = SetStatusArgs {
            status,
            info: info.to_owned(),
            data,
        };
        self.client.send(UNIT_FACADE, self.name(), "SetStatus", &args).await
    }

    /// Acknowledge an operator resolution.
    pub async fn clear_resolved(&self) -> Result<()> {
        self.client
            .send(UNIT_FACADE, self.name(), "ClearResolved", &Value::Null)
            .await
    }

    /// Open port ranges for the unit.
    pub async fn open_ports(&self, ports: &[PortRange]) -> Result<()> {
        let args = PortsArgs {
            ports: ports.to_vec(),
        };
        self.client.send(UNIT_FACADE, self.name(), "OpenPorts", &args).await
    }

    /// Close port ranges for the unit.
    pub async fn close_ports(&self, ports: &[PortRange]) -> Result<()> {
        let args = PortsArgs {
            ports: ports.to_vec(),
        };
        self.client.send(UNIT_FACADE, self.name(), "ClosePorts", &args).await
    }

    /// Publish metric samples collected by a hook.
    pub async fn add_metrics(&self, metrics: &[Metric]) -> Result<()> {
        let args = MetricsArgs {
            metrics: metrics.to_vec(),
        };
        self.client.send(UNIT_FACADE, self.name(), "AddMetrics", &args).await
    }

    /// Ask for the unit's machine to be rebooted.
    pub async fn request_reboot(&self, priority: RebootPriority) -> Result<()> {
        let args = RebootArgs { priority };
        self.client
            .send(UNIT_FACADE, self.name(), "RequestReboot", &args)
            .await
    }
}

/// Cached view of a service entity.
#[derive(Debug, Clone)]
pub struct Service {
    client: StateClient,
    doc: ServiceDoc,
}

impl Service {
    /// Service name.
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    /// Charm units of the service should run.
    pub fn charm_url(&self) -> &str {
        &self.doc.charm_url
    }

    /// Charm configuration settings.
    pub fn config(&self) -> &BTreeMap<String, Value> {
        &self.doc.config
    }

    /// Lifecycle stage as of the last refresh.
    pub fn life(&self) -> Life {
        self.doc.life
    }

    /// Re-read the document.
    pub async fn refresh(&mut self) -> Result<()> {
        self.doc = self.client.get(SERVICE_FACADE, &self.doc.name).await?;
        Ok(())
    }

    /// Watch the service for changes.
    pub async fn watch(&self) -> Result<EntityWatcher> {
        self.client.watch(SERVICE_FACADE, self.name()).await
    }
}

/// Cached view of a machine entity.
#[derive(Debug, Clone)]
pub struct Machine {
    client: StateClient,
    doc: MachineDoc,
}

impl Machine {
    /// Machine id.
    pub fn id(&self) -> &str {
        &self.doc.id
    }

    /// Provider instance id, once provisioned.
    pub fn instance_id(&self) -> Option<&str> {
        self.doc.instance_id.as_deref()
    }

    /// Lifecycle stage as of the last refresh.
    pub fn life(&self) -> Life {
        self.doc.life
    }

    /// Re-read the document.
    pub async fn refresh(&mut self) -> Result<()> {
        self.doc = self.client.get(MACHINE_FACADE, &self.doc.id).await?;
        Ok(())
    }

    /// Set the machine agent's password.
    pub async fn set_password(&self, password: &str) -> Result<()> {
        let args = PasswordArgs {
            password: password.to_owned(),
        };
        self.client.send(MACHINE_FACADE, self.id(), "SetPassword", &args).await
    }

    /// Watch the machine for changes.
    pub async fn watch(&self) -> Result<EntityWatcher> {
        self.client.watch(MACHINE_FACADE, self.id()).await
    }
}
