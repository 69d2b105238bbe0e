use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    /// Whether the blob and manifest directories are present.
    store: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let layout = state.engine().layout();
    let store = if layout.blobs_dir().is_dir() && layout.manifests_dir().is_dir() {
        "ok"
    } else {
        "missing"
    };
    Json(HealthResponse {
        status: "ok",
        store,
    })
}
