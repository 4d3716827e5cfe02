//! ---
//! unitd_section: "02-networking-rpc"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "State service call seam, entity accessors and change watchers."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::params::WatchResult;
use crate::task::{StopSignal, SupervisedTask};
use crate::{Result, RpcCaller, RpcError, WATCHER_FACADE};

/// Subscription to changes of one remote entity.
///
/// Notifications carry no payload: each one means "the entity may have
/// changed since you last looked". The first arrives immediately after
/// registration. A notification is only followed by another `Next` call once
/// the consumer has taken it, so a slow consumer sees changes coalesced
/// rather than queued.
#[derive(Debug)]
pub struct EntityWatcher {
    entity: String,
    watcher_id: String,
    changes: mpsc::Receiver<()>,
    task: SupervisedTask<RpcError>,
}

impl EntityWatcher {
    /// Register a watch on `facade`/`id` and start delivering notifications.
    ///
    /// A failed registration is returned as is; callers may retry it.
    pub async fn watch(caller: Arc<dyn RpcCaller>, facade: &str, id: &str) -> Result<Self> {
        let response = caller.call(facade, id, "Watch", Value::Null).await?;
        let WatchResult { watcher_id } = serde_json::from_value(response)?;
        let entity = format!("{facade}:{id}");
        debug!(entity = %entity, watcher = %watcher_id, "watch registered");

        let (tx, changes) = mpsc::channel(1);
        let task = SupervisedTask::spawn(format!("watcher {entity}"), {
            let entity = entity.clone();
            let watcher_id = watcher_id.clone();
            move |stop| run(caller, entity, watcher_id, tx, stop)
        });
        Ok(Self {
            entity,
            watcher_id,
            changes,
            task,
        })
    }

    /// Next change notification; `None` once the watcher has terminated.
    pub async fn changed(&mut self) -> Option<()> {
        self.changes.recv().await
    }

    /// `facade:id` of the watched entity.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Server-side watcher id.
    pub fn watcher_id(&self) -> &str {
        &self.watcher_id
    }

    /// Stop the remote watch and wait for the delivery task to exit.
    ///
    /// No notification is observable once this returns.
    pub async fn stop(&mut self) -> Result<()> {
        let outcome = self.task.stop().await;
        self.changes.close();
        while self.changes.try_recv().is_ok() {}
        debug!(entity = %self.entity, watcher = %self.watcher_id, "watcher stopped");
        outcome
    }

    /// Wait for the watcher to terminate on its own.
    pub async fn wait(&self) -> Result<()> {
        self.task.wait().await
    }

    /// Error the watcher terminated with, if it has terminated.
    pub fn err(&self) -> Option<RpcError> {
        self.task.err()
    }
}

async fn run(
    caller: Arc<dyn RpcCaller>,
    entity: String,
    watcher_id: String,
    tx: mpsc::Sender<()>,
    mut stop: StopSignal,
) -> Result<()> {
    let mut stop_sent = false;
    let outcome = loop {
        tokio::select! {
            biased;
            _ = stop.stopped() => break Ok(()),
            delivered = deliver(&tx) => {
                if !delivered {
                    break Ok(());
                }
                trace!(entity = %entity, "change delivered");
            }
        }

        let next = caller.call(WATCHER_FACADE, &watcher_id, "Next", Value::Null);
        tokio::pin!(next);
        let result = tokio::select! {
            result = &mut next => result,
            _ = stop.stopped() => {
                // The outstanding Next is answered with a stopped error once
                // the server has dropped the watcher.
                send_stop(caller.as_ref(), &entity, &watcher_id).await;
                stop_sent = true;
                next.await
            }
        };
        match result {
            Ok(_) => continue,
            Err(err) if err.is_stopped_or_not_found() && stop.is_stopping() => break Ok(()),
            Err(err) => {
                warn!(entity = %entity, watcher = %watcher_id, error = %err, "watcher terminated");
                break Err(err);
            }
        }
    };
    if !stop_sent {
        send_stop(caller.as_ref(), &entity, &watcher_id).await;
    }
    outcome
}

/// Hand one notification to the consumer, returning once it has been taken.
/// `false` means the consumer is gone.
async fn deliver(tx: &mpsc::Sender<()>) -> bool {
    if tx.send(()).await.is_err() {
        return false;
    }
    tx.reserve().await.is_ok()
}

async fn send_stop(caller: &dyn RpcCaller, entity: &str, watcher_id: &str) {
    if let Err(err) = caller.call(WATCHER_FACADE, watcher_id, "Stop", Value::Null).await {
        warn!(entity = %entity, watcher = %watcher_id, error = %err, "error trying to stop watcher");
    }
}
