//! System routes: /api/system, /api/config

use axum::{
    Json, Router,
    extract::State,
    response::Response,
    routing::{get, post},
};
use model_store::PruneReport;
use serde::Serialize;

use crate::config::AppConfig;
use crate::routes::error::blocking;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/system/prune", post(prune))
        .route("/api/system/info", get(system_info))
        .route("/api/config", get(get_config))
}

#[derive(Debug, Serialize)]
struct SystemInfoResponse {
    version: String,
    models_dir: String,
    models: usize,
    active_transfers: usize,
    max_concurrent_transfers: usize,
}

/// POST /api/system/prune: drop unreferenced blobs and stale temporaries
async fn prune(State(state): State<AppState>) -> Result<Json<PruneReport>, Response> {
    let engine = state.engine().clone();
    let report = blocking(move || engine.prune()).await?;
    state.broadcast_event("system.pruned", serde_json::to_value(&report).unwrap_or_default());
    Ok(Json(report))
}

/// GET /api/system/info
async fn system_info(State(state): State<AppState>) -> Result<Json<SystemInfoResponse>, Response> {
    let engine = state.engine().clone();
    let models = blocking(move || engine.manifests().list()).await?.len();
    Ok(Json(SystemInfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        models_dir: state.engine().layout().root().display().to_string(),
        models,
        active_transfers: state.engine().sessions().snapshots().len(),
        max_concurrent_transfers: state.config().max_concurrent_transfers,
    }))
}

/// GET /api/config: configuration the server was started with
async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.config().clone())
}
