//! Model routes: /api/models

use std::path::PathBuf;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use model_store::{ImportRequest, ModelDetails, ModelEntry};
use serde::Deserialize;
use tracing::info;

use crate::routes::error::{api_error, blocking};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/models", get(list_models))
        .route("/api/models/import", post(import_model))
        .route("/api/models/{name}", get(show_model).delete(delete_model))
        .route("/api/models/{name}/export", post(export_model))
}

//  Types

#[derive(Debug, Deserialize)]
struct ImportBody {
    /// Path of the GGUF file on the server's filesystem.
    path: PathBuf,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Debug, Deserialize)]
struct ExportBody {
    /// Destination path on the server's filesystem.
    path: PathBuf,
}

fn accepted(id: model_store::SessionId) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "status_url": format!("/api/transfers/{id}") })),
    )
        .into_response()
}

//  Handlers

/// GET /api/models: installed models, sorted by name
async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelEntry>>, Response> {
    let engine = state.engine().clone();
    blocking(move || engine.list()).await.map(Json)
}

/// GET /api/models/{name}: manifest and decoded config
async fn show_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ModelDetails>, Response> {
    let engine = state.engine().clone();
    blocking(move || engine.show(&name)).await.map(Json)
}

/// DELETE /api/models/{name}
async fn delete_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let engine = state.engine().clone();
    let target = name.clone();
    let manifest = blocking(move || engine.delete(&target)).await?;
    info!(model = %name, "Model deleted via API");
    state.broadcast_event(
        "model.deleted",
        serde_json::json!({ "name": name, "layers": manifest.layers.len() }),
    );
    Ok(Json(serde_json::json!({ "status": "deleted", "name": name })))
}

/// POST /api/models/import: start an import, 202 with the session id
async fn import_model(State(state): State<AppState>, Json(body): Json<ImportBody>) -> Response {
    if !body.path.is_file() {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("'{}' is not a file", body.path.display()),
            "invalid_request",
        );
    }
    let mut req = ImportRequest::new(body.path).overwrite(body.overwrite);
    if let Some(name) = body.name {
        req = req.named(name);
    }
    let id = state.transfers().start_import(req);
    info!(session = %id, "Import accepted");
    accepted(id)
}

/// POST /api/models/{name}/export: start an export, 202 with the session id
async fn export_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ExportBody>,
) -> Response {
    let id = state.transfers().start_export(name, body.path);
    info!(session = %id, "Export accepted");
    accepted(id)
}
