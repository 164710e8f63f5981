//! Read-only HTTP JSON API over one output directory.
use crate::checkpoint::{CandidateReport, CheckpointSource, CheckpointStore};
use crate::config::ServeConfig;
use crate::history;
use crate::output_dir::OutputDir;
use crate::session::{SessionStore, TrainingSession};
use crate::status::{monitor_status, MonitorStatus};
use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct AppState {
    output: OutputDir,
    model_extension: String,
}

#[derive(Debug, Serialize)]
struct CheckpointsView {
    candidates: Vec<CandidateReport>,
    latest_valid: Option<PathBuf>,
    latest_model: Option<PathBuf>,
}

pub async fn run(
    output: OutputDir,
    config: &ServeConfig,
    model_extension: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(output.clone(), model_extension);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        output_dir = %output.root().display(),
        "serve listening on {local_addr}"
    );

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(output: OutputDir, model_extension: &str) -> Router {
    let state = AppState {
        output,
        model_extension: model_extension.to_string(),
    };
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/checkpoints", get(api_checkpoints))
        .route("/api/recoveries", get(api_recoveries))
        .route("/api/session", get(api_session))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn api_status(State(state): State<AppState>) -> Json<MonitorStatus> {
    Json(monitor_status(&state.output))
}

async fn api_checkpoints(
    State(state): State<AppState>,
) -> Result<Json<CheckpointsView>, StatusCode> {
    let store = CheckpointStore::new(state.output.root(), &state.model_extension)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let view = tokio::task::spawn_blocking(move || CheckpointsView {
        candidates: store.scan(),
        latest_valid: store.latest_valid_state_checkpoint().map(|c| c.path),
        latest_model: store.latest_model_checkpoint(),
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(view))
}

async fn api_recoveries(
    State(state): State<AppState>,
) -> Result<Json<Vec<history::RecoveryRecord>>, StatusCode> {
    let Some(conn) = history::open_existing(&state.output.history_db())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    else {
        return Ok(Json(Vec::new()));
    };
    let records =
        history::list_recoveries(&conn, None).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(records))
}

async fn api_session(
    State(state): State<AppState>,
) -> Result<Json<TrainingSession>, StatusCode> {
    match SessionStore::new(&state.output).load() {
        Ok(Some(session)) => Ok(Json(session)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::warn!(error = %e, "failed to load session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
