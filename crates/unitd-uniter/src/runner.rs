//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use unitd_persistence::HookInfo;

use crate::error::HookFailure;

/// Environment variable carrying the active context id.
pub const ENV_CONTEXT_ID: &str = "UNITD_CONTEXT_ID";
/// Environment variable carrying the agent socket path.
pub const ENV_AGENT_SOCKET: &str = "UNITD_AGENT_SOCKET";

const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// Everything an executor needs to run one hook.
#[derive(Debug, Clone, Copy)]
pub struct HookRun<'a> {
    pub hook: &'a HookInfo,
    pub charm_dir: &'a Path,
    pub unit_name: &'a str,
    pub context_id: &'a str,
    pub socket: &'a Path,
}

/// Runs hook bodies. The engine never calls it twice concurrently.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn run(&self, run: HookRun<'_>) -> Result<(), HookFailure>;
}

/// Executes `<charm>/hooks/<name>` as a child process.
#[derive(Debug, Clone)]
pub struct ProcessHookExecutor {
    timeout: Duration,
}

impl ProcessHookExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HookExecutor for ProcessHookExecutor {
    async fn run(&self, run: HookRun<'_>) -> Result<(), HookFailure> {
        let hook = run.hook;
        let failure = |reason: String, exit_code: Option<i32>| HookFailure {
            hook: hook.clone(),
            reason,
            exit_code,
        };
        let path = run.charm_dir.join("hooks").join(hook.kind.hook_name());
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                info!(hook = %hook, path = %path.display(), "hook is not a file; skipping");
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(hook = %hook, "charm has no hook; skipping");
                return Ok(());
            }
            Err(err) => return Err(failure(format!("cannot stat {}: {err}", path.display()), None)),
        }

        let mut command = Command::new(&path);
        command
            .current_dir(run.charm_dir)
            .env("CHARM_DIR", run.charm_dir)
            .env("UNITD_UNIT_NAME", run.unit_name)
            .env(ENV_CONTEXT_ID, run.context_id)
            .env(ENV_AGENT_SOCKET, run.socket)
            .env("UNITD_HOOK_NAME", hook.kind.hook_name())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(relation_id) = hook.relation_id {
            command.env("UNITD_RELATION_ID", relation_id.to_string());
        }
        if let Some(remote_unit) = &hook.remote_unit {
            command.env("UNITD_REMOTE_UNIT", remote_unit);
        }

        let mut child = command
            .spawn()
            .map_err(|err| failure(format!("cannot start {}: {err}", path.display()), None))?;
        debug!(hook = %hook, pid = ?child.id(), "hook process started");
        let mut forwarders = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.spawn(forward_output(stdout, hook.to_string(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.spawn(forward_output(stderr, hook.to_string(), "stderr"));
        }

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let result = match waited {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(failure(format!("exited with {status}"), status.code())),
            Ok(Err(err)) => Err(failure(format!("cannot wait for hook process: {err}"), None)),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!(hook = %hook, error = %err, "unable to kill timed-out hook");
                }
                Err(failure(format!("timed out after {:?}", self.timeout), None))
            }
        };
        let drained = tokio::time::timeout(OUTPUT_DRAIN, async {
            while forwarders.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!(hook = %hook, "hook output still open after exit; closing it");
            forwarders.shutdown().await;
        }
        result
    }
}

async fn forward_output<R>(stream: R, hook: String, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(hook = %hook, stream = name, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use unitd_persistence::HookKind;

    fn write_hook(charm_dir: &Path, name: &str, body: &str) {
        let hooks = charm_dir.join("hooks");
        fs::create_dir_all(&hooks).unwrap();
        let path = hooks.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn run<'a>(hook: &'a HookInfo, charm_dir: &'a Path) -> HookRun<'a> {
        HookRun {
            hook,
            charm_dir,
            unit_name: "wordpress/0",
            context_id: "wordpress/0:install:1",
            socket: Path::new("/nonexistent/agent.socket"),
        }
    }

    #[tokio::test]
    async fn missing_hook_counts_as_success() {
        let dir = tempfile::tempdir().unwrap();
        let hook = HookInfo::new(HookKind::Install);
        ProcessHookExecutor::new(Duration::from_secs(5))
            .run(run(&hook, dir.path()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn environment_is_exported_to_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(
            dir.path(),
            "start",
            "#!/bin/sh\nprintf '%s|%s|%s' \"$UNITD_UNIT_NAME\" \"$UNITD_HOOK_NAME\" \"$UNITD_CONTEXT_ID\" > \"$CHARM_DIR/env.out\"\n",
        );
        let hook = HookInfo::new(HookKind::Start);
        ProcessHookExecutor::new(Duration::from_secs(5))
            .run(run(&hook, dir.path()))
            .await
            .unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("env.out")).unwrap(),
            "wordpress/0|start|wordpress/0:install:1"
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "stop", "#!/bin/sh\necho going down >&2\nexit 3\n");
        let hook = HookInfo::new(HookKind::Stop);
        let failure = ProcessHookExecutor::new(Duration::from_secs(5))
            .run(run(&hook, dir.path()))
            .await
            .unwrap_err();
        assert_eq!(failure.exit_code, Some(3));
        assert_eq!(failure.hook, hook);
    }

    #[tokio::test]
    async fn slow_hooks_are_killed() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "install", "#!/bin/sh\nexec sleep 30\n");
        let hook = HookInfo::new(HookKind::Install);
        let failure = ProcessHookExecutor::new(Duration::from_millis(200))
            .run(run(&hook, dir.path()))
            .await
            .unwrap_err();
        assert!(failure.reason.contains("timed out"));
        assert_eq!(failure.exit_code, None);
    }

    #[tokio::test]
    async fn background_children_do_not_hold_the_hook_open() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "start", "#!/bin/sh\necho starting\nsleep 6 &\nexit 0\n");
        let hook = HookInfo::new(HookKind::Start);
        let runtime = tokio::runtime::Handle::current();
        let alive_before = runtime.metrics().num_alive_tasks();
        let started = std::time::Instant::now();
        ProcessHookExecutor::new(Duration::from_secs(5))
            .run(run(&hook, dir.path()))
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(runtime.metrics().num_alive_tasks(), alive_before);
        assert!(elapsed >= OUTPUT_DRAIN, "returned before output drained: {elapsed:?}");
        assert!(elapsed < OUTPUT_DRAIN + Duration::from_secs(1), "streams drained one after another: {elapsed:?}");
    }
}
