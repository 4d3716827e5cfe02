//! ---
//! unitd_section: "01-core-functionality"
//! unitd_subsection: "binary"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Binary entrypoint for the unit agent."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};
use unitd_common::config::{AgentConfig, StateConfig};
use unitd_common::logging::init_tracing;
use unitd_metrics::{new_registry, spawn_http_server, AgentMetrics, SharedRegistry, UniterMetrics};
use unitd_persistence::{CharmStateFile, HookStateStore};
use unitd_rpc::{InMemoryState, StateClient, StateSeed};
use unitd_uniter::{
    invoke, LocalCharmRepository, ProcessHookExecutor, ToolRequest, UniterEngine, ENV_AGENT_SOCKET,
    ENV_CONTEXT_ID,
};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("unitd ", env!("CARGO_PKG_VERSION")),
    about = "Per-unit agent",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the unit agent until interrupted")]
    Run,
    #[command(about = "Print the persisted hook and charm records")]
    ShowState,
    #[command(about = "Invoke a hook tool against the running hook context")]
    HookTool {
        tool: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::HookTool { tool, args } => {
            let code = hook_tool(tool, args).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::ShowState => {
            let config = AgentConfig::load_with_source(&candidates(cli.config.as_deref()))?.config;
            show_state(&config)
        }
        Commands::Run => {
            let load_started = Instant::now();
            let loaded = AgentConfig::load_with_source(&candidates(cli.config.as_deref()))?;
            let load_duration = load_started.elapsed();
            let config = loaded.config;
            let guards = init_tracing("unitd", &config.logging)?;
            info!(source = %loaded.source.display(), unit = %config.unit_name, "configuration loaded");

            let registry = new_registry();
            let agent_metrics = AgentMetrics::new(registry.clone())?;
            agent_metrics.observe_config_load(load_duration.as_secs_f64());
            agent_metrics.inc_start();

            if let Err(err) = run_agent(config, registry).await {
                error!(error = %format!("{err:#}"), "unit agent failed");
                drop(guards);
                std::process::exit(1);
            }
            drop(guards);
            Ok(())
        }
    }
}

fn candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from("configs/unitd.toml"));
    candidates.push(PathBuf::from("/etc/unitd/unitd.toml"));
    candidates
}

enum Shutdown {
    Interrupted,
    EngineEnded,
}

async fn run_agent(config: AgentConfig, registry: SharedRegistry) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };
    let uniter_metrics = match &metrics_server {
        Some(_) => Some(UniterMetrics::new(registry.clone())?),
        None => None,
    };

    let state = load_state(&config.state)?;
    let client = StateClient::new(Arc::new(state));
    if let Some(password) = &config.password {
        let unit = client
            .unit(&config.unit_name)
            .await
            .with_context(|| format!("unable to fetch unit {}", config.unit_name))?;
        unit.set_password(password)
            .await
            .context("unable to set agent password")?;
        info!(unit = %config.unit_name, "agent password set");
    }

    let uniter_config = config.uniter();
    let executor = Arc::new(ProcessHookExecutor::new(uniter_config.hook_timeout));
    let charms = Arc::new(LocalCharmRepository::new(&uniter_config.charm_repository));
    let engine = UniterEngine::start(uniter_config, &client, executor, charms, uniter_metrics)
        .await
        .context("unable to start uniter")?;
    info!(unit = %engine.unit_name(), "unit agent running; waiting for termination signal");

    let shutdown = tokio::select! {
        interrupted = signal::ctrl_c() => {
            interrupted.context("unable to listen for ctrl-c")?;
            Shutdown::Interrupted
        }
        _ = engine.wait() => Shutdown::EngineEnded,
    };
    let result = match shutdown {
        Shutdown::Interrupted => {
            info!("ctrl-c received; shutting down");
            engine.stop().await
        }
        Shutdown::EngineEnded => engine.wait().await,
    };

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    result.context("uniter stopped with an error")?;
    info!(unit = %engine.unit_name(), "unit agent stopped");
    Ok(())
}

fn load_state(config: &StateConfig) -> Result<InMemoryState> {
    let Some(path) = &config.seed else {
        warn!("no state seed configured; starting with an empty state service");
        return Ok(InMemoryState::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read state seed {}", path.display()))?;
    let seed = StateSeed::from_json(&raw)
        .with_context(|| format!("invalid state seed {}", path.display()))?;
    Ok(InMemoryState::from_seed(seed))
}

fn show_state(config: &AgentConfig) -> Result<()> {
    let paths = config.uniter().paths();
    let hook = HookStateStore::new(&paths.hook_state)
        .read()
        .with_context(|| format!("unable to read hook state {}", paths.hook_state.display()))?;
    let charm = CharmStateFile::new(&paths.charm_state)
        .read()
        .with_context(|| format!("unable to read charm state {}", paths.charm_state.display()))?;
    let report = json!({
        "unit": config.unit_name,
        "root": paths.root,
        "hook": hook,
        "charm": charm,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn hook_tool(tool: String, args: Vec<String>) -> Result<i32> {
    let context_id = std::env::var(ENV_CONTEXT_ID)
        .with_context(|| format!("{ENV_CONTEXT_ID} is not set; hook tools only run inside hooks"))?;
    let socket = std::env::var_os(ENV_AGENT_SOCKET)
        .map(PathBuf::from)
        .with_context(|| format!("{ENV_AGENT_SOCKET} is not set; hook tools only run inside hooks"))?;
    let response = invoke(
        &socket,
        &ToolRequest {
            context_id,
            tool,
            args,
        },
    )
    .await
    .with_context(|| format!("unable to reach agent at {}", socket.display()))?;
    print!("{}", response.stdout);
    eprint!("{}", response.stderr);
    Ok(response.code)
}
