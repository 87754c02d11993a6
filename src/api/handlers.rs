use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::decision::Decision;
use crate::engine::types::{BusinessFields, ExecutionState, FlowStatus, RunInputs};
use crate::engine::{EngineError, StartOptions, time_budget};
use crate::storage::validate_run_key;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize, Default)]
pub struct StartRunRequest {
    /// Server-side paths of the files uploaded for this session.
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

/// What a caller sees of a run after a start call.
#[derive(Serialize)]
pub struct RunSummary {
    pub run_key: String,
    pub session_id: String,
    pub session_num: u32,
    pub flow_status: FlowStatus,
    pub completed_nodes: Vec<String>,
    pub last_completed_node: Option<String>,
    pub decision: Option<Decision>,
    pub decision_reasoning: Option<String>,
    pub messages: Vec<String>,
    pub errors: Vec<String>,
    pub business_fields: BusinessFields,
}

impl RunSummary {
    pub fn from_state(state: &ExecutionState) -> Self {
        Self {
            run_key: state.run_key.clone(),
            session_id: state.session_id.clone(),
            session_num: state.session_num,
            flow_status: state.flow_status,
            completed_nodes: state.completed_nodes.clone(),
            last_completed_node: state.last_completed_node.clone(),
            decision: state.decision.clone(),
            decision_reasoning: state.decision_reasoning.clone(),
            messages: state.messages.clone(),
            errors: state.errors.clone(),
            business_fields: state.business_fields.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct ListProjectsQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /projects/{key}/runs
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<StartRunRequest>,
) -> Result<Json<RunSummary>, AppError> {
    check_key(&key)?;
    if state.engine.is_active(&key) {
        return Err(EngineError::RunActive(key).into());
    }
    if let Some(missing) = req.files.iter().find(|f| !f.exists()) {
        return Err(AppError::BadRequest(format!(
            "File not found: {}",
            missing.display()
        )));
    }

    let deadline = time_budget(req.timeout_s)
        .map_err(|e| AppError::BadRequest(format!("Invalid timeout_s: {}", e)))?;

    let permit = state
        .runs
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AppError::Internal(e.into()))?;

    let inputs = RunInputs {
        files: req.files,
        context: req.context,
    };
    let options = StartOptions {
        force_restart: req.restart,
        cancel: None,
        deadline,
    };

    info!(run_key = %key, "Run requested via API");

    // A dropped connection must not abandon the run between checkpoints.
    let engine = state.engine.clone();
    let handle = tokio::spawn(async move {
        let _permit = permit;
        engine.start(&key, inputs, options).await
    });

    let result = handle
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("run task failed: {}", e)))?;

    let final_state = result?;
    Ok(Json(RunSummary::from_state(&final_state)))
}

/// GET /projects
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListProjectsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status_filter = params
        .status
        .as_deref()
        .map(parse_status)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let checkpoints = state.engine.store().list_checkpoints(status_filter).await?;

    let summaries: Vec<serde_json::Value> = checkpoints
        .iter()
        .map(|cp| {
            serde_json::json!({
                "run_key": cp.run_key,
                "session_num": cp.session_num,
                "flow_status": cp.flow_status,
                "last_completed_node": cp.last_completed_node,
                "decision": cp.decision,
                "saved_at": cp.saved_at,
                "active": state.engine.is_active(&cp.run_key),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "projects": summaries,
        "total": summaries.len(),
    })))
}

/// GET /projects/{key}
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    check_key(&key)?;
    let store = state.engine.store();

    let checkpoint = store.load_checkpoint(&key).await?;
    let snapshot = store.load_snapshot(&key).await?;
    if checkpoint.is_none() && snapshot.is_none() {
        return Err(AppError::NotFound(format!("Project '{}' not found", key)));
    }

    Ok(Json(serde_json::json!({
        "run_key": key,
        "active": state.engine.is_active(&key),
        "checkpoint": checkpoint,
        "snapshot": snapshot,
    })))
}

/// DELETE /projects/{key}
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    check_key(&key)?;
    if state.engine.is_active(&key) {
        return Err(AppError::Conflict(format!(
            "Project '{}' has a run in progress",
            key
        )));
    }

    let store = state.engine.store();
    if store.load_checkpoint(&key).await?.is_none() && store.load_snapshot(&key).await?.is_none()
    {
        return Err(AppError::NotFound(format!("Project '{}' not found", key)));
    }

    store.delete_run(&key).await?;

    Ok(Json(serde_json::json!({
        "deleted": key,
    })))
}

/// GET /graph
pub async fn get_graph(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let graph = state.engine.graph();
    let edges: Vec<serde_json::Value> = graph
        .edges()
        .into_iter()
        .map(|(from, to)| serde_json::json!({ "from": from, "to": to }))
        .collect();
    let nodes: Vec<serde_json::Value> = state
        .engine
        .registry()
        .list()
        .into_iter()
        .map(|(name, description)| serde_json::json!({ "id": name, "description": description }))
        .collect();

    Json(serde_json::json!({
        "entry": graph.entry(),
        "branch": graph.branch(),
        "terminal": graph.terminal(),
        "nodes": nodes,
        "edges": edges,
        "routes": graph.routes(),
    }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn check_key(key: &str) -> Result<(), AppError> {
    validate_run_key(key).map_err(|e| AppError::BadRequest(e.to_string()))
}

fn parse_status(s: &str) -> Result<FlowStatus, String> {
    FlowStatus::parse(s).ok_or_else(|| {
        format!(
            "Invalid status '{}'. Use: not_started, in_progress, completed, failed",
            s
        )
    })
}
