//! Sync endpoint routes.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use crate::error::Result;
use crate::handlers::{
    announce, handle_pull, handle_push, PullQuery, PullResponse, PushRequest, PushResponse,
};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync", get(pull_handler).post(push_handler))
}

/// POST /sync - Send a batch of records.
async fn push_handler(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let response = handle_push(
        &state.pool,
        &state.codec,
        state.config.push_batch_max,
        request,
    )
    .await?;

    // HTTP pushes notify WebSocket clients too.
    announce(&state, None, response.confirmed_records());

    Ok(Json(response))
}

/// GET /sync - Fetch records changed since a sync token.
async fn pull_handler(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>> {
    let response = handle_pull(
        &state.pool,
        &state.codec,
        state.config.pull_limit_max,
        query,
    )
    .await?;
    Ok(Json(response))
}
