//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
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
            move || metrics_response(registry.clone())
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
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, app)
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

/// Prometheus scrape response in text exposition format. Shared by the dedicated
/// exporter and the API router.
pub async fn metrics_response(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
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
    /// Return the bound address for convenience.
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

/// Metrics recorded by the ingestion and broadcast pipeline.
#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    readings_ingested: IntCounter,
    anomalous_readings: IntCounter,
    ingest_failures: IntCounter,
    messages_delivered: IntCounter,
    subscribers_dropped: IntCounter,
    subscribers_active: IntGauge,
}

impl PipelineMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let readings_ingested = IntCounter::with_opts(Opts::new(
            "gridtel_readings_ingested_total",
            "Readings committed by the ingestion coordinator",
        ))?;
        registry.register(Box::new(readings_ingested.clone()))?;

        let anomalous_readings = IntCounter::with_opts(Opts::new(
            "gridtel_anomalous_readings_total",
            "Committed readings outside the nominal voltage window or above the current alarm",
        ))?;
        registry.register(Box::new(anomalous_readings.clone()))?;

        let ingest_failures = IntCounter::with_opts(Opts::new(
            "gridtel_ingest_failures_total",
            "Ingestion batches rejected or rolled back",
        ))?;
        registry.register(Box::new(ingest_failures.clone()))?;

        let messages_delivered = IntCounter::with_opts(Opts::new(
            "gridtel_broadcast_messages_delivered_total",
            "Messages handed to subscriber queues",
        ))?;
        registry.register(Box::new(messages_delivered.clone()))?;

        let subscribers_dropped = IntCounter::with_opts(Opts::new(
            "gridtel_broadcast_subscribers_dropped_total",
            "Subscribers removed after a failed delivery",
        ))?;
        registry.register(Box::new(subscribers_dropped.clone()))?;

        let subscribers_active = IntGauge::with_opts(Opts::new(
            "gridtel_subscribers_active",
            "Currently registered live subscribers",
        ))?;
        registry.register(Box::new(subscribers_active.clone()))?;

        Ok(Self {
            readings_ingested,
            anomalous_readings,
            ingest_failures,
            messages_delivered,
            subscribers_dropped,
            subscribers_active,
        })
    }

    pub fn record_ingested(&self, readings: usize, anomalous: usize) {
        self.readings_ingested.inc_by(readings as u64);
        self.anomalous_readings.inc_by(anomalous as u64);
    }

    pub fn record_ingest_failure(&self) {
        self.ingest_failures.inc();
    }

    pub fn record_broadcast(&self, delivered: usize, dropped: usize) {
        self.messages_delivered.inc_by(delivered as u64);
        self.subscribers_dropped.inc_by(dropped as u64);
    }

    pub fn set_subscribers(&self, count: usize) {
        self.subscribers_active.set(count as i64);
    }
}

pub use prometheus;
