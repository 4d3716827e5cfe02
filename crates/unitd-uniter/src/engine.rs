//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! The uniter mode machine.
//!
//! Each [`Mode`] has one dispatch function returning the next mode. Modes run
//! strictly one after another on a single task, so at most one hook is ever in
//! flight. Every decision is re-derived from freshly read remote state and the
//! local records; notifications only say "look again".
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use unitd_common::{UniterConfig, UnitPaths};
use unitd_metrics::UniterMetrics;
use unitd_persistence::{CharmChangeKind, CharmRef, HookInfo, HookKind, HookPhase, HookStateStore};
use unitd_rpc::{
    EntityWatcher, Life, ResolvedMode, RpcError, Service, StateClient, StopSignal, SupervisedTask,
    Unit, UnitStatus,
};

use crate::charm::{CharmDeploymentTracker, CharmSource};
use crate::context::{config_digest, ContextOutcome, HookContext};
use crate::error::{EngineError, HookFailure};
use crate::ipc::ContextServer;
use crate::runner::{HookExecutor, HookRun};

/// State of the mode machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Resume from the persisted records.
    Init,
    /// Deploy a first charm, then run `install`.
    Installing(CharmRef),
    /// Deploy a new charm revision, then run `upgrade-charm`.
    Upgrading(CharmRef),
    /// Execute one hook end to end.
    RunHook(HookInfo),
    /// Commit a hook that already succeeded.
    Commit(HookInfo),
    /// A hook failed; dispatch is halted until an operator resolves it.
    HookError(HookInfo),
    /// Steady state.
    Abide,
    Stopped,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Init => "init",
            Mode::Installing(_) => "installing",
            Mode::Upgrading(_) => "upgrading",
            Mode::RunHook(_) => "run-hook",
            Mode::Commit(_) => "commit",
            Mode::HookError(_) => "hook-error",
            Mode::Abide => "abide",
            Mode::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Installing(charm) | Mode::Upgrading(charm) => write!(f, "{}({charm})", self.name()),
            Mode::RunHook(hook) | Mode::Commit(hook) | Mode::HookError(hook) => {
                write!(f, "{}({hook})", self.name())
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Handle to a running uniter.
///
/// Dropping the handle asks the engine to stop; [`stop`](Self::stop) also
/// waits for it and for every watcher it owns.
#[derive(Debug)]
pub struct UniterEngine {
    unit_name: String,
    history: watch::Receiver<Vec<Mode>>,
    failure: Arc<Mutex<Option<HookFailure>>>,
    task: SupervisedTask<EngineError>,
}

impl UniterEngine {
    /// Fetch the unit and its service, then start the mode loop.
    pub async fn start(
        config: UniterConfig,
        client: &StateClient,
        executor: Arc<dyn HookExecutor>,
        charms: Arc<dyn CharmSource>,
        metrics: Option<UniterMetrics>,
    ) -> Result<Self, EngineError> {
        let paths = config.paths();
        std::fs::create_dir_all(&paths.state_dir)?;
        let unit = client.unit(&config.unit_name).await?;
        let service = client.service(unit.service_name()).await?;
        info!(unit = %config.unit_name, root = %paths.root.display(), "uniter starting");

        let (history_tx, history) = watch::channel(Vec::new());
        let failure = Arc::new(Mutex::new(None));
        let uniter = Uniter {
            hooks: HookStateStore::new(&paths.hook_state),
            charm: CharmDeploymentTracker::new(&paths, charms, config.commit_retry.clone()),
            paths,
            unit,
            service,
            executor,
            metrics,
            unit_watcher: None,
            service_watcher: None,
            history: history_tx,
            failure: failure.clone(),
        };
        let task = SupervisedTask::spawn(format!("uniter {}", config.unit_name), move |stop| {
            uniter.run(stop)
        });
        Ok(Self {
            unit_name: config.unit_name,
            history,
            failure,
            task,
        })
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    /// Every mode entered so far, in order.
    pub fn history(&self) -> Vec<Mode> {
        self.history.borrow().clone()
    }

    /// Current mode; `None` before the loop entered its first one.
    pub fn mode(&self) -> Option<Mode> {
        self.history.borrow().last().cloned()
    }

    /// Wait until the mode history satisfies `pred`, returning it.
    ///
    /// If the engine ends first, returns the final history whether or not it
    /// matches.
    pub async fn wait_for(&self, mut pred: impl FnMut(&[Mode]) -> bool) -> Vec<Mode> {
        let mut history = self.history.clone();
        let matched = history.wait_for(|modes| pred(modes)).await.map(|modes| modes.clone());
        match matched {
            Ok(modes) => modes,
            Err(_) => self.history(),
        }
    }

    /// Failure blocking dispatch, if any.
    pub fn last_hook_failure(&self) -> Option<HookFailure> {
        self.failure.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the mode loop and every task it owns, then report how it ended.
    ///
    /// A hook that is running is allowed to finish first.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.task.stop().await
    }

    /// Wait for the engine to end on its own (unit dead or fatal error).
    pub async fn wait(&self) -> Result<(), EngineError> {
        self.task.wait().await
    }
}

struct Uniter {
    paths: UnitPaths,
    unit: Unit,
    service: Service,
    hooks: HookStateStore,
    charm: CharmDeploymentTracker,
    executor: Arc<dyn HookExecutor>,
    metrics: Option<UniterMetrics>,
    unit_watcher: Option<EntityWatcher>,
    service_watcher: Option<EntityWatcher>,
    history: watch::Sender<Vec<Mode>>,
    failure: Arc<Mutex<Option<HookFailure>>>,
}

/// Which watcher woke the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Stop,
    Unit,
    UnitClosed,
    Service,
    ServiceClosed,
}

impl Uniter {
    async fn run(mut self, mut stop: StopSignal) -> Result<(), EngineError> {
        let mut mode = Mode::Init;
        let result = loop {
            if stop.is_stopping() && mode != Mode::Stopped {
                debug!(unit = %self.unit.name(), interrupted = %mode, "stop requested");
                mode = Mode::Stopped;
            }
            self.enter(&mode);
            let next = match mode {
                Mode::Init => self.init().await,
                Mode::Installing(charm) => self.deploy(charm, CharmChangeKind::Installing).await,
                Mode::Upgrading(charm) => self.deploy(charm, CharmChangeKind::Upgrading).await,
                Mode::RunHook(hook) => self.run_hook(hook).await,
                Mode::Commit(hook) => self.commit(hook).await,
                Mode::HookError(hook) => self.hook_error(hook, &mut stop).await,
                Mode::Abide => self.abide(&mut stop).await,
                Mode::Stopped => break Ok(()),
            };
            match next {
                Ok(next) => mode = next,
                Err(err) => {
                    error!(unit = %self.unit.name(), error = %err, "uniter failed");
                    break Err(err);
                }
            }
        };
        self.teardown().await;
        info!(unit = %self.unit.name(), "uniter stopped");
        result
    }

    fn enter(&self, mode: &Mode) {
        info!(unit = %self.unit.name(), mode = %mode, "mode entered");
        if let Some(metrics) = &self.metrics {
            metrics.mode_entered(mode.name());
        }
        self.history.send_modify(|history| history.push(mode.clone()));
    }

    async fn init(&mut self) -> Result<Mode, EngineError> {
        if let Some(state) = self.hooks.read()?.filter(|state| state.in_flight()) {
            if state.hook.kind.is_relation() {
                return Err(EngineError::NotImplemented(format!(
                    "resuming relation hook {}",
                    state.hook
                )));
            }
            info!(unit = %self.unit.name(), hook = %state.hook, phase = %state.phase, "resuming interrupted hook");
            return Ok(match state.phase {
                HookPhase::Succeeded => Mode::Commit(state.hook),
                _ => Mode::RunHook(state.hook),
            });
        }
        if let Some(intent) = self.charm.pending()? {
            info!(unit = %self.unit.name(), charm = %intent.charm, kind = %intent.kind, "resuming charm change");
            return Ok(match intent.kind {
                CharmChangeKind::Installing => Mode::Installing(intent.charm),
                CharmChangeKind::Upgrading => Mode::Upgrading(intent.charm),
            });
        }
        if self.charm.deployed()?.is_none() {
            let charm = CharmRef::parse(self.service.charm_url())?;
            return Ok(Mode::Installing(charm));
        }
        Ok(Mode::Abide)
    }

    async fn deploy(&mut self, charm: CharmRef, kind: CharmChangeKind) -> Result<Mode, EngineError> {
        self.charm.begin(&charm, kind)?;
        self.charm.apply(&charm)?;
        self.charm.remote_commit(&self.unit, &charm).await?;
        let hook = match kind {
            CharmChangeKind::Installing => HookKind::Install,
            CharmChangeKind::Upgrading => HookKind::UpgradeCharm,
        };
        Ok(Mode::RunHook(HookInfo::new(hook)))
    }

    async fn run_hook(&mut self, hook: HookInfo) -> Result<Mode, EngineError> {
        if hook.kind.is_relation() {
            return Err(EngineError::NotImplemented(format!("relation hook {hook}")));
        }
        self.unit.refresh().await?;
        self.service.refresh().await?;
        let ctx = HookContext::new(
            self.unit.doc(),
            hook.clone(),
            self.service.config().clone(),
            self.charm.metrics()?,
        );
        let context_id = ctx.id().to_owned();
        self.hooks.start(&hook, Some(ctx.config_digest().to_owned()))?;
        if matches!(hook.kind, HookKind::Install | HookKind::UpgradeCharm) {
            self.charm.clear()?;
        }
        if let Some(metrics) = &self.metrics {
            metrics.hook_started(hook.kind.hook_name());
        }

        let ctx = Arc::new(Mutex::new(ctx));
        let server = ContextServer::start(&self.paths.socket, ctx.clone())?;
        let started = Instant::now();
        info!(unit = %self.unit.name(), hook = %hook, "running hook");
        let outcome = self
            .executor
            .run(HookRun {
                hook: &hook,
                charm_dir: self.charm.charm_dir(),
                unit_name: self.unit.name(),
                context_id: &context_id,
                socket: &self.paths.socket,
            })
            .await;
        let served = server.stop().await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_hook_duration(started.elapsed().as_secs_f64());
        }
        served?;
        let effects = ctx.lock().take_outcome();

        match outcome {
            Ok(()) => {
                self.flush(&effects).await?;
                self.hooks.write(&hook, HookPhase::Succeeded)?;
                info!(unit = %self.unit.name(), hook = %hook, elapsed = ?started.elapsed(), "hook succeeded");
                Ok(Mode::Commit(hook))
            }
            Err(failure) => {
                warn!(unit = %self.unit.name(), hook = %hook, reason = %failure.reason, "hook failed");
                if !effects.is_empty() {
                    debug!(hook = %hook, "discarding side effects of failed hook");
                }
                if let Some(metrics) = &self.metrics {
                    metrics.hook_failed(hook.kind.hook_name());
                }
                self.report_failure(&failure).await?;
                Ok(Mode::HookError(hook))
            }
        }
    }

    async fn flush(&self, effects: &ContextOutcome) -> Result<(), EngineError> {
        if !effects.close.is_empty() {
            self.unit.close_ports(&effects.close).await?;
        }
        if !effects.open.is_empty() {
            self.unit.open_ports(&effects.open).await?;
        }
        if !effects.metrics.is_empty() {
            self.unit.add_metrics(&effects.metrics).await?;
        }
        if let Some(priority) = effects.reboot {
            info!(unit = %self.unit.name(), priority = %priority, "reboot requested by hook");
            self.unit.request_reboot(priority).await?;
        }
        Ok(())
    }

    async fn report_failure(&self, failure: &HookFailure) -> Result<(), EngineError> {
        let data = json!({
            "hook": failure.hook.kind.hook_name(),
            "relation-id": failure.hook.relation_id,
            "remote-unit": failure.hook.remote_unit,
            "exit-code": failure.exit_code,
            "reason": failure.reason,
        });
        self.unit
            .set_status(
                UnitStatus::Error,
                &format!("hook failed: {:?}", failure.hook.kind.hook_name()),
                Some(data),
            )
            .await?;
        *self.failure.lock() = Some(failure.clone());
        Ok(())
    }

    async fn commit(&mut self, hook: HookInfo) -> Result<Mode, EngineError> {
        if hook.kind.is_relation() {
            return Err(EngineError::NotImplemented(format!("committing relation hook {hook}")));
        }
        let mut progress = self.hooks.progress();
        let digest = self
            .hooks
            .current()
            .filter(|state| state.hook == hook)
            .and_then(|state| state.config_digest.clone());
        match hook.kind {
            HookKind::Start => progress.started = true,
            HookKind::Stop => progress.started = false,
            HookKind::ConfigChanged => progress.applied_config = digest,
            // The new charm has not seen any configuration yet.
            HookKind::UpgradeCharm => progress.applied_config = None,
            _ => {}
        }
        let status = match (hook.kind, progress.started) {
            (HookKind::Stop, _) => UnitStatus::Stopped,
            (_, true) => UnitStatus::Started,
            (_, false) => UnitStatus::Installed,
        };
        self.unit.set_status(status, "", None).await?;
        self.hooks.commit(&hook, progress)?;
        self.failure.lock().take();
        if let Some(metrics) = &self.metrics {
            metrics.hook_committed(hook.kind.hook_name());
        }
        info!(unit = %self.unit.name(), hook = %hook, "hook committed");
        Ok(if hook.kind == HookKind::Stop {
            Mode::Stopped
        } else {
            Mode::Abide
        })
    }

    async fn abide(&mut self, stop: &mut StopSignal) -> Result<Mode, EngineError> {
        self.ensure_watchers().await?;
        loop {
            self.unit.refresh().await?;
            self.service.refresh().await?;
            if let Some(next) = self.decide()? {
                return Ok(next);
            }
            match self.wake(stop).await {
                Wake::Stop => return Ok(Mode::Stopped),
                Wake::UnitClosed => return Err(self.watcher_failed(Wake::Unit).await),
                Wake::ServiceClosed => return Err(self.watcher_failed(Wake::Service).await),
                Wake::Unit | Wake::Service => {}
            }
        }
    }

    fn decide(&self) -> Result<Option<Mode>, EngineError> {
        match self.unit.life() {
            Life::Dead => return Ok(Some(Mode::Stopped)),
            Life::Dying => {
                let stopped = self.hooks.current().is_some_and(|state| {
                    state.hook.kind == HookKind::Stop && state.phase == HookPhase::Committed
                });
                return Ok(Some(if stopped {
                    Mode::Stopped
                } else {
                    Mode::RunHook(HookInfo::new(HookKind::Stop))
                }));
            }
            Life::Alive => {}
        }
        let target = CharmRef::parse(self.service.charm_url())?;
        if self.charm.deployed()?.as_ref() != Some(&target) {
            return Ok(Some(Mode::Upgrading(target)));
        }
        let progress = self.hooks.progress();
        let digest = config_digest(self.service.config());
        if progress.applied_config.as_deref() != Some(digest.as_str()) {
            return Ok(Some(Mode::RunHook(HookInfo::new(HookKind::ConfigChanged))));
        }
        if !progress.started {
            return Ok(Some(Mode::RunHook(HookInfo::new(HookKind::Start))));
        }
        Ok(None)
    }

    async fn hook_error(&mut self, hook: HookInfo, stop: &mut StopSignal) -> Result<Mode, EngineError> {
        self.ensure_watchers().await?;
        loop {
            self.unit.refresh().await?;
            if self.unit.life() == Life::Dead {
                return Ok(Mode::Stopped);
            }
            match self.unit.resolved() {
                ResolvedMode::Retry => {
                    self.unit.clear_resolved().await?;
                    info!(unit = %self.unit.name(), hook = %hook, "retrying failed hook");
                    return Ok(Mode::RunHook(hook));
                }
                ResolvedMode::NoHooks => {
                    self.unit.clear_resolved().await?;
                    self.hooks.write(&hook, HookPhase::Succeeded)?;
                    info!(unit = %self.unit.name(), hook = %hook, "failed hook marked resolved");
                    return Ok(Mode::Commit(hook));
                }
                ResolvedMode::None => {}
            }
            match self.wake(stop).await {
                Wake::Stop => return Ok(Mode::Stopped),
                Wake::UnitClosed => return Err(self.watcher_failed(Wake::Unit).await),
                Wake::ServiceClosed => return Err(self.watcher_failed(Wake::Service).await),
                Wake::Unit | Wake::Service => {}
            }
        }
    }

    async fn ensure_watchers(&mut self) -> Result<(), EngineError> {
        if self.unit_watcher.is_none() {
            self.unit_watcher = Some(self.unit.watch().await?);
        }
        if self.service_watcher.is_none() {
            self.service_watcher = Some(self.service.watch().await?);
        }
        Ok(())
    }

    async fn wake(&mut self, stop: &mut StopSignal) -> Wake {
        let wake = tokio::select! {
            _ = stop.stopped() => Wake::Stop,
            changed = next_change(&mut self.unit_watcher) => match changed {
                Some(()) => Wake::Unit,
                None => Wake::UnitClosed,
            },
            changed = next_change(&mut self.service_watcher) => match changed {
                Some(()) => Wake::Service,
                None => Wake::ServiceClosed,
            },
        };
        if let Some(metrics) = &self.metrics {
            match wake {
                Wake::Unit => metrics.notification("unit"),
                Wake::Service => metrics.notification("service"),
                _ => {}
            }
        }
        wake
    }

    async fn watcher_failed(&mut self, which: Wake) -> EngineError {
        let slot = match which {
            Wake::Service => &mut self.service_watcher,
            _ => &mut self.unit_watcher,
        };
        let Some(watcher) = slot.take() else {
            return EngineError::Transport(RpcError::Transport("watcher missing".into()));
        };
        let source = match watcher.wait().await {
            Err(err) => err,
            Ok(()) => RpcError::Transport("watcher closed unexpectedly".into()),
        };
        EngineError::Watcher {
            entity: watcher.entity().to_owned(),
            source,
        }
    }

    async fn teardown(&mut self) {
        for slot in [&mut self.unit_watcher, &mut self.service_watcher] {
            if let Some(mut watcher) = slot.take() {
                if let Err(err) = watcher.stop().await {
                    warn!(watcher = %watcher.entity(), error = %err, "watcher ended with error");
                }
            }
        }
    }
}

async fn next_change(watcher: &mut Option<EntityWatcher>) -> Option<()> {
    match watcher {
        Some(watcher) => watcher.changed().await,
        None => std::future::pending().await,
    }
}
