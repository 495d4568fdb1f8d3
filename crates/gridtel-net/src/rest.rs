//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "REST endpoints for ingestion, queries and reports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gridtel_common::Reading;
use gridtel_core::{
    FilterParams, GridError, IngestionCoordinator, QueryService, ReportService, ValidationError,
};
use gridtel_metrics::SharedRegistry;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::websocket;

/// Records generated by `/generate` when `num_records` is omitted.
pub const DEFAULT_NUM_RECORDS: usize = 10;

/// Services shared by every request handler.
pub struct ApiContext {
    /// Write path: generate, persist, broadcast.
    pub coordinator: Arc<IngestionCoordinator>,
    /// Read path over the store.
    pub query: QueryService,
    /// Narrative report generation.
    pub reports: ReportService,
    /// Registry exposed at `/metrics`, if any.
    pub metrics: Option<SharedRegistry>,
    /// Batch size used by `/generate` without `num_records`.
    pub default_num_records: usize,
}

impl ApiContext {
    /// Bundle the services with default request settings.
    pub fn new(
        coordinator: Arc<IngestionCoordinator>,
        query: QueryService,
        reports: ReportService,
    ) -> Self {
        Self {
            coordinator,
            query,
            reports,
            metrics: None,
            default_num_records: DEFAULT_NUM_RECORDS,
        }
    }

    /// Expose `registry` at `/metrics`.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics = Some(registry);
        self
    }

    /// Override the default `/generate` batch size.
    pub fn with_default_num_records(mut self, count: usize) -> Self {
        self.default_num_records = count;
        self
    }
}

pub(crate) struct RouterState {
    pub(crate) context: Arc<ApiContext>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

/// Builder used to configure and spawn the API server.
#[derive(Clone)]
pub struct ApiServerBuilder {
    listen: SocketAddr,
    context: Arc<ApiContext>,
    cors_origins: Vec<String>,
}

impl ApiServerBuilder {
    /// Construct a builder serving `context` on `listen`.
    pub fn new(listen: SocketAddr, context: ApiContext) -> Self {
        Self {
            listen,
            context: Arc::new(context),
            cors_origins: Vec::new(),
        }
    }

    /// Origins allowed by the CORS layer. Unparseable entries are skipped.
    pub fn with_cors_origins(mut self, origins: impl IntoIterator<Item = String>) -> Self {
        self.cors_origins = origins.into_iter().collect();
        self
    }

    /// Bind the listener, spawn the server and return a handle for shutdown.
    pub async fn spawn(self) -> anyhow::Result<ApiServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "api server listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = Arc::new(RouterState {
            context: self.context,
            shutdown: shutdown_rx.clone(),
        });
        let router = router(state).layer(cors_layer(&self.cors_origins));

        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "api server exited with error");
            }
        });

        Ok(ApiServerHandle {
            address: local_addr,
            task,
            shutdown: shutdown_tx,
        })
    }
}

/// Handle returned from [`ApiServerBuilder::spawn`].
pub struct ApiServerHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ApiServerHandle {
    /// Socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Close live feeds, stop accepting requests and wait for the server task.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(join) => Err(anyhow::anyhow!(join)),
        }
    }
}

fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/data", get(get_data).delete(delete_data))
        .route("/data/filter", get(get_filtered))
        .route("/generate", post(post_generate))
        .route("/report", post(post_report))
        .route("/metrics", get(get_metrics))
        .route("/ws", get(websocket::upgrade_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GenerateParams {
    #[serde(default)]
    num_records: Option<i64>,
}

async fn get_root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to the Grid Data API! Visit /health, /data or /ws for live readings."
    }))
}

async fn get_health(State(state): State<Arc<RouterState>>) -> Response {
    match state.context.query.health().await {
        Ok(()) => Json(json!({
            "status": "healthy",
            "database_connection": "ok",
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database_connection": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn get_data(
    State(state): State<Arc<RouterState>>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    Ok(Json(state.context.query.latest(params.limit).await?))
}

async fn get_filtered(
    State(state): State<Arc<RouterState>>,
    Query(params): Query<FilterParams>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    Ok(Json(state.context.query.filter(&params).await?))
}

async fn delete_data(State(state): State<Arc<RouterState>>) -> Result<Json<Value>, ApiError> {
    state.context.query.delete_all().await?;
    Ok(Json(json!({
        "message": "All grid data records have been deleted."
    })))
}

async fn post_generate(
    State(state): State<Arc<RouterState>>,
    Query(params): Query<GenerateParams>,
) -> Result<Json<Value>, ApiError> {
    let count = match params.num_records {
        None => state.context.default_num_records,
        Some(requested) if requested < 0 => {
            return Err(GridError::from(ValidationError::NegativeCount(requested)).into())
        }
        Some(requested) => usize::try_from(requested).unwrap_or(usize::MAX),
    };
    let inserted = state.context.coordinator.ingest(count).await?.len();
    Ok(Json(json!({
        "message": format!("Successfully inserted {inserted} new records."),
        "rows_inserted": inserted,
    })))
}

async fn post_report(
    State(state): State<Arc<RouterState>>,
    Json(readings): Json<Vec<Reading>>,
) -> Result<Json<Value>, ApiError> {
    let report = state.context.reports.generate_report(&readings).await?;
    Ok(Json(json!({ "report": report })))
}

async fn get_metrics(State(state): State<Arc<RouterState>>) -> Response {
    let Some(registry) = &state.context.metrics else {
        return ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "metrics registry unavailable")
            .into_response();
    };
    gridtel_metrics::metrics_response(registry.clone())
        .await
        .into_response()
}
