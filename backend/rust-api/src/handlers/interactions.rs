use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use super::error_response;
use super::live::attached;
use crate::extractors::AppJson;
use crate::models::InteractionOp;
use crate::services::orchestrator::OrchestratorError;
use crate::services::AppState;

/// POST /api/v1/live/sessions/{id}/blocks/{block_id}/interactions/{participant_id}
pub async fn apply_interaction(
    State(state): State<Arc<AppState>>,
    Path((session_id, block_id, participant_id)): Path<(String, String, String)>,
    AppJson(op): AppJson<InteractionOp>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::debug!(
        "Interaction {:?} on block {} by {} in session {}",
        op,
        block_id,
        participant_id,
        session_id
    );

    let handle = attached(&state, &session_id).await?;
    let report = handle
        .interact(&state.interactions, &block_id, &participant_id, op)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::OK, Json(report)))
}

/// GET /api/v1/live/sessions/{id}/blocks/{block_id}/interactions
pub async fn list_interactions(
    State(state): State<Arc<AppState>>,
    Path((session_id, block_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let reports = state
        .interactions
        .list(&session_id, &block_id)
        .await
        .map_err(|e| error_response(OrchestratorError::Interaction(e)))?;

    Ok((StatusCode::OK, Json(reports)))
}
