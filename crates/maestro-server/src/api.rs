//! The submission API: `agent.*` and `mission.*` operations over HTTP.
//!
//! Responses carry the explicit field names of the mission/agent models;
//! errors are structured `{"error": {"kind", "message"}}` records. Enum
//! fields arrive as strings and are validated on parse -- an unknown
//! value is a `validation` error, not a 500.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use maestro_core::error::QueueError;
use maestro_core::orchestrator::Orchestrator;
use maestro_core::queue::EnqueueRequest;
use maestro_core::registry::SpawnConfig;
use maestro_db::StorageError;
use maestro_db::models::{
    AgentRole, FailureKind, Mission, MissionFailure, MissionKind, MissionOutcome, MissionPriority,
    ModelTier, ParseEnumError,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "notfound",
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            kind: "validation",
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": { "kind": self.kind, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ParseEnumError> for AppError {
    fn from(err: ParseEnumError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::Full { .. } => StatusCode::TOO_MANY_REQUESTS,
            QueueError::Validation(_) | QueueError::DependencyCycle { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::InvalidTransition { .. } => StatusCode::CONFLICT,
            QueueError::Storage(StorageError::NotFound(_)) => StatusCode::NOT_FOUND,
            QueueError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct SpawnRequest {
    pub name: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SpawnPoolRequest {
    pub count: usize,
    #[serde(flatten)]
    pub template: SpawnRequest,
}

#[derive(Debug, Deserialize)]
pub struct DistributeRequest {
    pub prompt: String,
    pub context: Option<String>,
    pub priority: Option<String>,
    pub kind: Option<String>,
    pub timeout_ms: Option<i64>,
    pub max_retries: Option<i32>,
    pub retry_delay_ms: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub parent_mission_id: Option<Uuid>,
    pub unified_task_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub output: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DistributeResponse {
    pub mission_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub agents: usize,
    pub queue_depth: usize,
    pub missions_by_status: serde_json::Map<String, serde_json::Value>,
}

fn parse_enum<T: FromStr<Err = ParseEnumError>>(
    raw: &Option<String>,
    default: T,
) -> Result<T, AppError> {
    match raw {
        Some(value) => Ok(value.parse::<T>()?),
        None => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/agent/spawn", post(spawn_agent))
        .route("/api/agent/spawn_pool", post(spawn_pool))
        .route("/api/agent/{id}/kill", post(kill_agent))
        .route("/api/agent/{id}/restart", post(restart_agent))
        .route("/api/agent/{id}/health", get(agent_health))
        .route("/api/agent/health", get(agent_health_all))
        .route("/api/agent/status", get(agent_status))
        .route("/api/mission/distribute", post(distribute_mission))
        .route("/api/mission/{id}/complete", post(complete_mission))
        .route("/api/mission/{id}/fail", post(fail_mission))
        .route("/api/mission/{id}/cancel", post(cancel_mission))
        .route("/api/mission/{id}/status", get(mission_status))
        .route("/api/status", get(system_status))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

/// Serve the API until ctrl-c.
pub async fn run_serve(orchestrator: Arc<Orchestrator>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(orchestrator);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("maestro listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("maestro api shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Agent handlers
// ---------------------------------------------------------------------------

async fn spawn_agent(
    State(orch): State<Arc<Orchestrator>>,
    Json(req): Json<SpawnRequest>,
) -> Result<impl IntoResponse, AppError> {
    let cfg = spawn_config(&req)?;
    let row = orch
        .registry()
        .spawn_agent(cfg)
        .await
        .map_err(AppError::internal)?;
    Ok((StatusCode::CREATED, Json(row)))
}

fn spawn_config(req: &SpawnRequest) -> Result<SpawnConfig, AppError> {
    let role: AgentRole = parse_enum(&req.role, AgentRole::Generalist)?;
    let model: ModelTier = parse_enum(&req.model, ModelTier::Sonnet)?;
    Ok(SpawnConfig {
        name: req.name.clone(),
        role,
        model,
        ..SpawnConfig::default()
    })
}

async fn spawn_pool(
    State(orch): State<Arc<Orchestrator>>,
    Json(req): Json<SpawnPoolRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.count == 0 || req.count > 32 {
        return Err(AppError::validation("count must be between 1 and 32"));
    }
    let cfg = spawn_config(&req.template)?;
    let rows = orch
        .registry()
        .spawn_pool(req.count, cfg)
        .await
        .map_err(AppError::internal)?;
    Ok((StatusCode::CREATED, Json(rows)))
}

async fn kill_agent(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if orch.registry().get_agent(id).await.is_none() {
        return Err(AppError::not_found(format!("agent {id} not found")));
    }
    orch.registry().kill(id).await.map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({"id": id, "status": "stopped"})))
}

async fn restart_agent(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if orch.registry().get_agent(id).await.is_none() {
        return Err(AppError::not_found(format!("agent {id} not found")));
    }
    let row = orch
        .registry()
        .restart(id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(row))
}

async fn agent_health(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    match orch.registry().health_check(id).await {
        Some(health) => Ok(Json(health)),
        None => Err(AppError::not_found(format!("agent {id} not found"))),
    }
}

async fn agent_health_all(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orch.registry().health_check_all().await)
}

async fn agent_status(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orch.registry().list_agents().await)
}

// ---------------------------------------------------------------------------
// Mission handlers
// ---------------------------------------------------------------------------

async fn distribute_mission(
    State(orch): State<Arc<Orchestrator>>,
    Json(req): Json<DistributeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let priority: MissionPriority = parse_enum(&req.priority, MissionPriority::Normal)?;
    let kind: MissionKind = parse_enum(&req.kind, MissionKind::General)?;
    let defaults = EnqueueRequest::default();

    let mission_ids = orch
        .distribute(EnqueueRequest {
            prompt: req.prompt,
            context: req.context,
            priority,
            kind,
            timeout_ms: req.timeout_ms.unwrap_or(defaults.timeout_ms),
            max_retries: req.max_retries.unwrap_or(defaults.max_retries),
            retry_delay_ms: req.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            depends_on: req.depends_on,
            parent_mission_id: req.parent_mission_id,
            unified_task_id: req.unified_task_id,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(DistributeResponse { mission_ids })))
}

async fn complete_mission(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<Mission>, AppError> {
    orch.queue()
        .complete(
            id,
            MissionOutcome {
                output: req.output,
                duration_ms: req.duration_ms,
                input_tokens: req.input_tokens,
                output_tokens: req.output_tokens,
            },
        )
        .await?;
    fetch_mission(&orch, id).await
}

async fn fail_mission(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Json(req): Json<FailRequest>,
) -> Result<Json<Mission>, AppError> {
    let kind: FailureKind = req.kind.parse()?;
    orch.queue()
        .fail(id, MissionFailure::new(kind, req.message))
        .await?;
    fetch_mission(&orch, id).await
}

async fn cancel_mission(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Mission>, AppError> {
    orch.queue().cancel(id).await?;
    fetch_mission(&orch, id).await
}

async fn mission_status(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Mission>, AppError> {
    fetch_mission(&orch, id).await
}

async fn fetch_mission(orch: &Orchestrator, id: Uuid) -> Result<Json<Mission>, AppError> {
    // Prefer the live mirror; fall back to the store for cleaned-up rows.
    if let Some(mission) = orch.queue().get_mission(id).await {
        return Ok(Json(mission));
    }
    match maestro_db::queries::missions::get_mission(orch.pool(), id).await? {
        Some(mission) => Ok(Json(mission)),
        None => Err(AppError::not_found(format!("mission {id} not found"))),
    }
}

async fn system_status(
    State(orch): State<Arc<Orchestrator>>,
) -> Result<Json<StatusResponse>, AppError> {
    let counts = maestro_db::queries::missions::count_by_status(orch.pool()).await?;
    let mut missions_by_status = serde_json::Map::new();
    for (status, count) in counts {
        missions_by_status.insert(status.to_string(), serde_json::json!(count));
    }

    Ok(Json(StatusResponse {
        agents: orch.registry().len().await,
        queue_depth: orch.queue().queued_depth().await,
        missions_by_status,
    }))
}
