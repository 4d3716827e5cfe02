//! ---
//! unitd_section: "03-persistence-logging"
//! unitd_subsection: "module"
//! unitd_type: "source"
//! unitd_scope: "code"
//! unitd_description: "Metrics collection and export utilities."
//! unitd_version: "v0.0.0-prealpha"
//! unitd_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
    TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the agent.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT))],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the requested one when port 0 was asked for.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone, Debug)]
pub struct AgentMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl AgentMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "unitd_starts_total",
            "Total number of times the unit agent has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "unitd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

/// Hook and mode-machine metrics recorded by the uniter engine.
#[derive(Clone, Debug)]
pub struct UniterMetrics {
    registry: SharedRegistry,
    hooks_started: IntCounterVec,
    hooks_failed: IntCounterVec,
    hooks_committed: IntCounterVec,
    hook_duration_seconds: Histogram,
    mode_transitions: IntCounterVec,
    watcher_notifications: IntCounterVec,
}

impl UniterMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let hooks_started = IntCounterVec::new(
            Opts::new("unitd_hooks_started_total", "Hook executions started, by hook"),
            &["hook"],
        )?;
        registry.register(Box::new(hooks_started.clone()))?;

        let hooks_failed = IntCounterVec::new(
            Opts::new("unitd_hooks_failed_total", "Hook executions that failed, by hook"),
            &["hook"],
        )?;
        registry.register(Box::new(hooks_failed.clone()))?;

        let hooks_committed = IntCounterVec::new(
            Opts::new("unitd_hooks_committed_total", "Hooks committed, by hook"),
            &["hook"],
        )?;
        registry.register(Box::new(hooks_committed.clone()))?;

        let buckets = prometheus::exponential_buckets(0.01, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let hook_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "unitd_hook_duration_seconds",
                "Wall-clock time spent running hook processes",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(hook_duration_seconds.clone()))?;

        let mode_transitions = IntCounterVec::new(
            Opts::new(
                "unitd_mode_transitions_total",
                "Mode machine transitions, by entered mode",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(mode_transitions.clone()))?;

        let watcher_notifications = IntCounterVec::new(
            Opts::new(
                "unitd_watcher_notifications_total",
                "Change notifications consumed, by watched entity kind",
            ),
            &["entity"],
        )?;
        registry.register(Box::new(watcher_notifications.clone()))?;

        Ok(Self {
            registry,
            hooks_started,
            hooks_failed,
            hooks_committed,
            hook_duration_seconds,
            mode_transitions,
            watcher_notifications,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn hook_started(&self, hook: &str) {
        self.hooks_started.with_label_values(&[hook]).inc();
    }

    pub fn hook_failed(&self, hook: &str) {
        self.hooks_failed.with_label_values(&[hook]).inc();
    }

    pub fn hook_committed(&self, hook: &str) {
        self.hooks_committed.with_label_values(&[hook]).inc();
    }

    pub fn observe_hook_duration(&self, seconds: f64) {
        self.hook_duration_seconds.observe(seconds);
    }

    pub fn mode_entered(&self, mode: &str) {
        self.mode_transitions.with_label_values(&[mode]).inc();
    }

    pub fn notification(&self, entity: &str) {
        self.watcher_notifications.with_label_values(&[entity]).inc();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn uniter_metrics_register_once_per_registry() {
        let registry = new_registry();
        let metrics = UniterMetrics::new(registry.clone()).unwrap();
        metrics.hook_started("install");
        metrics.hook_committed("install");
        metrics.mode_entered("abide");
        assert!(UniterMetrics::new(registry.clone()).is_err());

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"unitd_hooks_started_total".to_owned()));
        assert!(names.contains(&"unitd_mode_transitions_total".to_owned()));
    }

    #[tokio::test]
    async fn http_server_serves_and_shuts_down() {
        let registry = new_registry();
        let agent = AgentMetrics::new(registry.clone()).unwrap();
        agent.inc_start();
        let server = spawn_http_server(registry, SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        assert_ne!(server.addr().port(), 0);

        let mut stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        assert!(
            head.lines()
                .any(|line| line.eq_ignore_ascii_case(&format!("content-type: {TEXT_FORMAT}"))),
            "{head}"
        );
        assert!(body.contains("unitd_starts_total 1"), "{body}");

        server.shutdown().await.unwrap();
    }
}
