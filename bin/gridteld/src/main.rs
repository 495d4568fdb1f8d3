//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the gridtel daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridtel_common::config::AppConfig;
use gridtel_common::logging::init_tracing;
use gridtel_common::SystemClock;
use gridtel_core::{
    HttpTextGenerator, IngestionCoordinator, QueryService, ReportService, SubscriberRegistry,
};
use gridtel_metrics::{new_registry, spawn_http_server, PipelineMetrics, SharedRegistry};
use gridtel_net::{ApiContext, ApiServerBuilder};
use gridtel_persistence::{ReadingStore, SqliteReadingStore, StoreMetrics};
use gridtel_sim::{ReadingGenerator, ReadingSource, ScenarioSource};
use tokio::signal;
use tracing::{info, warn};

const SERVICE_NAME: &str = "gridteld";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Grid telemetry ingestion daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Fall back to built-in defaults when no configuration file exists")]
    defaults: bool,

    #[arg(long, value_name = "ADDR", help = "Override the API listen address")]
    listen: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Serve the HTTP and WebSocket API")]
    Run,
    #[command(about = "Generate and store a batch of readings, then exit")]
    Generate {
        #[arg(long, default_value_t = 10, help = "Number of readings to generate")]
        count: usize,
    },
    #[command(about = "Delete every stored reading, then exit")]
    Purge,
    #[command(about = "Validate configuration and print the effective settings")]
    CheckConfig,
}

/// Long-lived services shared by the API and the one-shot commands.
struct Services {
    store: Arc<SqliteReadingStore>,
    coordinator: Arc<IngestionCoordinator>,
    registry: SharedRegistry,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/gridteld.toml"));
    candidates.push(PathBuf::from("configs/gridteld.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates, cli.defaults)?;
    let mut config = loaded.config;
    if let Some(listen) = cli.listen {
        config.api.listen = listen;
    }
    let command = cli.command.unwrap_or(Commands::Run);

    if let Commands::CheckConfig = command {
        let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
        match &loaded.source {
            Some(path) => println!("# source: {}", path.display()),
            None => println!("# source: built-in defaults"),
        }
        println!("{rendered}");
        return Ok(());
    }

    init_tracing(SERVICE_NAME, &config.logging)?;
    info!(
        source = ?loaded.source,
        elapsed_ms = load_started.elapsed().as_millis() as u64,
        "configuration loaded"
    );

    let services = build_services(&config)?;

    match command {
        Commands::Run => run_daemon(config, services).await?,
        Commands::Generate { count } => {
            let readings = services.coordinator.ingest(count).await?;
            println!("{}", serde_json::to_string_pretty(&readings)?);
            info!(count = readings.len(), "batch generated");
        }
        Commands::Purge => {
            let removed = services.store.delete_all().await?;
            println!("removed {removed} readings");
        }
        Commands::CheckConfig => {}
    }

    Ok(())
}

fn build_services(config: &AppConfig) -> Result<Services> {
    let registry = new_registry();
    let pipeline_metrics = PipelineMetrics::new(registry.clone())?;
    let store_metrics = StoreMetrics::new(registry.clone())?;

    let store = Arc::new(
        SqliteReadingStore::open(&config.storage.path)
            .with_context(|| format!("failed to open store {}", config.storage.path.display()))?
            .with_metrics(store_metrics),
    );
    info!(location = %store.location(), "reading store ready");

    let source: Box<dyn ReadingSource> = match &config.generator.scenario {
        Some(path) => {
            let scenario = ScenarioSource::from_path(path)?;
            info!(path = %path.display(), samples = scenario.len(), "replaying scripted scenario");
            Box::new(scenario)
        }
        None => {
            if config.generator.seed.is_some() {
                info!(seed = ?config.generator.seed, "using seeded reading generator");
            }
            Box::new(ReadingGenerator::from_config(&config.generator))
        }
    };

    let subscribers =
        SubscriberRegistry::with_metrics(config.broadcast.subscriber_capacity, pipeline_metrics.clone());
    let coordinator = IngestionCoordinator::new(
        store.clone(),
        source,
        subscribers,
        Arc::new(SystemClock),
    )
    .with_max_batch(config.ingest.max_batch)
    .with_metrics(pipeline_metrics);

    Ok(Services {
        store,
        coordinator: Arc::new(coordinator),
        registry,
    })
}

async fn run_daemon(config: AppConfig, services: Services) -> Result<()> {
    let metrics_server = if config.metrics.dedicated_listener {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(services.registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics served on the api listener only");
        None
    };

    let generator = HttpTextGenerator::from_config(&config.report)?;
    let context = ApiContext::new(
        services.coordinator.clone(),
        QueryService::new(services.store.clone()),
        ReportService::new(Arc::new(generator)),
    )
    .with_metrics_registry(services.registry.clone())
    .with_default_num_records(config.ingest.default_num_records);

    let api_server = ApiServerBuilder::new(config.api.listen, context)
        .with_cors_origins(config.api.cors_origins.clone())
        .spawn()
        .await
        .with_context(|| format!("failed to start api server on {}", config.api.listen))?;
    info!(address = %api_server.local_addr(), "daemon running; waiting for termination signal");

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    api_server.shutdown().await?;
    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics exporter shutdown failed");
        }
    }
    info!(
        subscribers = services.coordinator.registry().len(),
        "api server stopped"
    );
    Ok(())
}
