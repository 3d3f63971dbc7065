#![forbid(unsafe_code)]

//! **verdict-service** – Main orchestration service for Verdict.
//!
//! Hosts the synchronous HTTP surface over the orchestrator runtime: event
//! ingestion, investigator projections and liveness/readiness probes.
//!
//! ## Usage
//!
//! ```bash
//! # Start with the durable sled store
//! verdict-service --db-path data/verdict.db
//!
//! # Development mode: in-memory store, scripted risk evaluator
//! verdict-service --storage memory --log-level debug
//!
//! # Point at a real risk service and a policy configuration
//! verdict-service --config config/verdict.toml --risk-url https://risk.internal/evaluate
//! ```
//!
//! Exit codes: `0` clean shutdown, `2` configuration error, `3` workflow
//! store unavailable, `1` other runtime failures.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use verdict_bus_core::{DecisionBus, InMemoryBus};
use verdict_risk::{HttpRiskEvaluator, RiskEvaluator, StaticRiskEvaluator};
use verdict_runtime::{queries, IngressResponse, Orchestrator, RuntimeConfig};
use verdict_store_core::{WorkflowFilter, WorkflowStore};
use verdict_store_memory::MemoryStore;
use verdict_store_sled::SledStore;
use verdict_types::{TenantId, WorkflowId, WorkflowState};

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "verdict-service")]
#[command(about = "Verdict orchestration service - regulated decision workflows")]
#[command(version)]
struct Cli {
    /// Runtime configuration file (TOML); defaults apply when omitted
    #[arg(long)]
    config: Option<String>,

    /// Storage backend (memory, sled)
    #[arg(long, default_value = "sled")]
    storage: String,

    /// Database path for persistent storage
    #[arg(long, default_value = "data/verdict.db")]
    db_path: String,

    /// Risk service endpoint; a deterministic local evaluator is used when
    /// omitted
    #[arg(long, env = "VERDICT_RISK_URL")]
    risk_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// HTTP listen port
    #[arg(long, default_value = "8080")]
    port: u16,
}

//─────────────────────────────
//  Failure classification
//─────────────────────────────

enum ServiceError {
    Config(anyhow::Error),
    Store(anyhow::Error),
    Runtime(anyhow::Error),
}

impl ServiceError {
    fn exit_code(&self) -> ExitCode {
        match self {
            ServiceError::Config(_) => ExitCode::from(2),
            ServiceError::Store(_) => ExitCode::from(3),
            ServiceError::Runtime(_) => ExitCode::from(1),
        }
    }

    fn inner(&self) -> &anyhow::Error {
        match self {
            ServiceError::Config(err) | ServiceError::Store(err) | ServiceError::Runtime(err) => {
                err
            }
        }
    }
}

//─────────────────────────────
//  Service state
//─────────────────────────────

#[derive(Clone)]
struct ServiceState {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn WorkflowStore>,
}

//─────────────────────────────
//  API types
//─────────────────────────────

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    tenant: Option<String>,
    state: Option<String>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Err(err) = init_logging(&cli.log_level) {
        eprintln!("failed to initialise logging: {err}");
        return ExitCode::from(2);
    }

    match run(cli).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{:#}", err.inner()), "service failed");
            err.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<(), ServiceError> {
    info!("starting verdict-service v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path).map_err(ServiceError::Config)?,
        None => RuntimeConfig::default(),
    };

    let store = build_store(&cli).map_err(ServiceError::Store)?;
    let risk = build_risk(&cli, &config).map_err(ServiceError::Config)?;
    let bus: Arc<dyn DecisionBus> = Arc::new(InMemoryBus::default());

    let orchestrator = Arc::new(
        Orchestrator::new(config, Arc::clone(&store), risk, bus)
            .map_err(ServiceError::Config)?,
    );

    let state = ServiceState { orchestrator, store };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
        .map_err(ServiceError::Runtime)?;
    info!(%addr, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")
        .map_err(ServiceError::Runtime)
}

fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/workflows", get(list_workflows))
        .route("/workflows/:workflow_id/current", get(current_decision))
        .route("/workflows/:workflow_id/decisions", get(decision_timeline))
        .route("/workflows/:workflow_id/dead-letters", get(dead_letters))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_store(cli: &Cli) -> Result<Arc<dyn WorkflowStore>> {
    match cli.storage.as_str() {
        "memory" => {
            info!("using in-memory workflow store (non-durable)");
            Ok(Arc::new(MemoryStore::new()))
        }
        "sled" => {
            info!(path = %cli.db_path, "opening sled workflow store");
            let store = SledStore::open(&cli.db_path)
                .with_context(|| format!("failed to open sled store at {}", cli.db_path))?;
            Ok(Arc::new(store))
        }
        other => anyhow::bail!("unknown storage backend {other:?} (expected memory or sled)"),
    }
}

fn build_risk(cli: &Cli, config: &RuntimeConfig) -> Result<Arc<dyn RiskEvaluator>> {
    match &cli.risk_url {
        Some(url) => {
            info!(%url, "using remote risk service");
            let evaluator = HttpRiskEvaluator::new(url, config.risk_timeout())
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Ok(Arc::new(evaluator))
        }
        None => {
            info!("no risk service configured, using deterministic local evaluator");
            Ok(Arc::new(StaticRiskEvaluator::approving()))
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing: {e}"))
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

async fn ingest_event(
    State(state): State<ServiceState>,
    Json(raw): Json<serde_json::Value>,
) -> (StatusCode, Json<IngestResponse>) {
    match state.orchestrator.submit(raw).await {
        IngressResponse::Accepted { event_id } => (
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                status: "accepted",
                event_id: Some(event_id.to_string()),
                error: None,
            }),
        ),
        IngressResponse::Duplicate { event_id } => (
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                status: "duplicate",
                event_id: Some(event_id.to_string()),
                error: None,
            }),
        ),
        IngressResponse::Backpressure { event_id } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(IngestResponse {
                status: "backpressure",
                event_id: Some(event_id.to_string()),
                error: None,
            }),
        ),
        IngressResponse::Invalid { error } => (
            StatusCode::BAD_REQUEST,
            Json(IngestResponse {
                status: "invalid",
                event_id: None,
                error: Some(error.to_string()),
            }),
        ),
    }
}

async fn current_decision(
    State(state): State<ServiceState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let decision = queries::current_decision(state.store.as_ref(), &WorkflowId::new(workflow_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    serde_json::to_value(decision)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn decision_timeline(
    State(state): State<ServiceState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let timeline = queries::timeline(state.store.as_ref(), &WorkflowId::new(workflow_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    serde_json::to_value(timeline)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn dead_letters(
    State(state): State<ServiceState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let letters = state
        .store
        .list_dead_letters(&WorkflowId::new(workflow_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    serde_json::to_value(letters)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn list_workflows(
    State(state): State<ServiceState>,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let state_filter = match params.state.as_deref() {
        None => None,
        Some(raw) => Some(parse_state(raw).ok_or(StatusCode::BAD_REQUEST)?),
    };
    let filter = WorkflowFilter {
        tenant_id: params.tenant.map(TenantId::new),
        state: state_filter,
        created_after: params.after,
        created_before: params.before,
    };
    let workflows = queries::list_workflows(state.store.as_ref(), &filter)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    serde_json::to_value(workflows)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

fn parse_state(raw: &str) -> Option<WorkflowState> {
    serde_json::from_value(serde_json::Value::String(raw.to_owned())).ok()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

async fn ready(State(state): State<ServiceState>) -> Result<Json<HealthResponse>, StatusCode> {
    // Readiness means the store answers; the probe workflow never exists.
    state
        .store
        .load(&WorkflowId::new("readiness-probe"))
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(HealthResponse { status: "ready", version: env!("CARGO_PKG_VERSION") }))
}
