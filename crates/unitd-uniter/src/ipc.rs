//! ---
//! unitd_section: "04-configuration-orchestration"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Uniter mode machine, charm deployment and hook execution."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
//! Local socket serving hook tools for the running hook.
//!
//! One JSON request per line, one JSON response per line. The server lives
//! exactly as long as the hook it serves.
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use unitd_rpc::{StopSignal, SupervisedTask};

use crate::context::HookContext;
use crate::error::{ContextError, EngineError};
use crate::tools::run_tool;

/// Request sent by a hook tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub context_id: String,
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// What the hook tool prints and exits with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub code: i32,
}

impl ToolResponse {
    fn success(stdout: String) -> Self {
        Self {
            stdout,
            stderr: String::new(),
            code: 0,
        }
    }

    fn failure(err: &ContextError) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("error: {err}\n"),
            code: err.exit_code(),
        }
    }
}

/// Tool server bound to one hook context.
#[derive(Debug)]
pub struct ContextServer {
    socket: PathBuf,
    task: SupervisedTask<EngineError>,
}

impl ContextServer {
    /// Bind `socket`, replacing a leftover from an earlier run, and start serving.
    pub fn start(socket: &Path, ctx: Arc<Mutex<HookContext>>) -> Result<Self, EngineError> {
        match std::fs::remove_file(socket) {
            Ok(()) => debug!(socket = %socket.display(), "removed stale agent socket"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(socket)?;
        info!(socket = %socket.display(), context = %ctx.lock().id(), "hook context serving");
        let path = socket.to_path_buf();
        let task = SupervisedTask::spawn(format!("ipc {}", socket.display()), move |stop| {
            serve(listener, path, ctx, stop)
        });
        Ok(Self {
            socket: socket.to_path_buf(),
            task,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Stop accepting, drop open connections and remove the socket file.
    pub async fn stop(self) -> Result<(), EngineError> {
        self.task.stop().await
    }
}

async fn serve(
    listener: UnixListener,
    socket: PathBuf,
    ctx: Arc<Mutex<HookContext>>,
    mut stop: StopSignal,
) -> Result<(), EngineError> {
    let mut connections = JoinSet::new();
    let result = loop {
        tokio::select! {
            _ = stop.stopped() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(handle_connection(stream, ctx.clone()));
                }
                Err(err) => break Err(EngineError::from(err)),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    warn!(error = %err, "hook tool connection task failed");
                }
            }
        }
    };
    connections.shutdown().await;
    drop(listener);
    match std::fs::remove_file(&socket) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(socket = %socket.display(), error = %err, "unable to remove agent socket"),
    }
    debug!(socket = %socket.display(), "hook context closed");
    result
}

async fn handle_connection(stream: UnixStream, ctx: Arc<Mutex<HookContext>>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "hook tool connection read failed");
                break;
            }
        };
        let response = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(request) => dispatch(&ctx, &request),
            Err(err) => ToolResponse::failure(&ContextError::arguments(
                "request",
                format!("malformed request: {err}"),
            )),
        };
        let mut payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "unable to encode tool response");
                break;
            }
        };
        payload.push(b'\n');
        if let Err(err) = write.write_all(&payload).await {
            debug!(error = %err, "hook tool went away before reading its response");
            break;
        }
    }
}

fn dispatch(ctx: &Mutex<HookContext>, request: &ToolRequest) -> ToolResponse {
    let mut ctx = ctx.lock();
    if let Err(err) = ctx.check_id(&request.context_id) {
        warn!(tool = %request.tool, "hook tool request rejected: context id mismatch");
        return ToolResponse::failure(&err);
    }
    match run_tool(&mut ctx, &request.tool, &request.args) {
        Ok(stdout) => {
            debug!(tool = %request.tool, hook = %ctx.hook(), "hook tool succeeded");
            ToolResponse::success(stdout)
        }
        Err(err) => {
            debug!(tool = %request.tool, hook = %ctx.hook(), error = %err, "hook tool failed");
            ToolResponse::failure(&err)
        }
    }
}

/// Send one request to the server at `socket` and read its response.
pub async fn invoke(socket: &Path, request: &ToolRequest) -> io::Result<ToolResponse> {
    let stream = UnixStream::connect(socket).await?;
    let (read, mut write) = stream.into_split();
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    write.write_all(&payload).await?;
    let line = BufReader::new(read)
        .lines()
        .next_line()
        .await?
        .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "agent closed the connection"))?;
    Ok(serde_json::from_str(&line)?)
}
