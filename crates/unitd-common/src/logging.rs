//! ---
//! unitd_section: "01-core-functionality"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Shared primitives and utilities for the unit agent."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "UNITD_LOG";

/// Available log formats for the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Owns the non-blocking writer guards. Dropping it flushes buffered records,
/// so the binary keeps it alive until just before exiting.
#[must_use = "dropping the guards stops log delivery"]
pub struct LogGuards {
    _file: WorkerGuard,
    _stdout: WorkerGuard,
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `UNITD_LOG` overrides the log filter (e.g. `info`, `debug,unitd_rpc=trace`).
///   When unset the standard `RUST_LOG` variable is honoured, finally defaulting to `info`.
/// * Stdout carries structured JSON or pretty output depending on [`LogFormat`], while a
///   rolling daily JSON file is kept for post-mortem analysis of hook failures.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<LogGuards> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, format!("{prefix}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to info logging");
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let fmt_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, "tracing initialised");
    Ok(LogGuards {
        _file: file_guard,
        _stdout: stdout_guard,
    })
}
