//! Transfer routes: /api/transfers

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use model_store::SessionId;
use tracing::info;

use crate::routes::error::api_error;
use crate::services::transfer_manager::TransferReport;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/transfers", get(list_transfers))
        .route("/api/transfers/{id}", get(get_transfer))
        .route("/api/transfers/{id}/cancel", post(cancel_transfer))
}

fn parse_id(raw: &str) -> Result<SessionId, Response> {
    raw.parse().map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("'{raw}' is not a transfer id"),
            "invalid_request",
        )
    })
}

/// GET /api/transfers: running and recently finished transfers
async fn list_transfers(State(state): State<AppState>) -> Json<Vec<TransferReport>> {
    Json(state.transfers().list())
}

/// GET /api/transfers/{id}
async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransferReport>, Response> {
    let id = parse_id(&id)?;
    state.transfers().get(id).map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Transfer '{id}' not found"),
            "not_found",
        )
    })
}

/// POST /api/transfers/{id}/cancel: cooperative; takes effect at the next blob boundary
async fn cancel_transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), Response> {
    let id = parse_id(&id)?;
    if !state.transfers().cancel(id) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Transfer '{id}' is not running"),
            "not_found",
        ));
    }
    info!(session = %id, "Cancellation requested via API");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id, "status": "cancelling" })),
    ))
}
