use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::{error_response, remote_status};
use crate::extractors::AppJson;
use crate::models::{
    Block, BlockStatus, CreateSessionRequest, HostAction, Session, SessionMode,
};
use crate::services::interaction::PluginSpec;
use crate::services::orchestrator::OrchestratorHandle;
use crate::services::remote::SessionSource;
use crate::services::AppState;

const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const JOIN_CODE_LEN: usize = 6;

#[derive(Debug, Deserialize, Default)]
pub struct AttachParams {
    #[serde(default)]
    pub mode: SessionMode,
}

/// POST /api/v1/live/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<CreateSessionRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    req.validate()
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let blocks = req
        .blocks
        .into_iter()
        .enumerate()
        .map(|(position, block)| Block {
            id: Uuid::new_v4().to_string(),
            position: position as u32,
            plugin: block.plugin,
            content: block.content,
            settings: block.settings,
            status: BlockStatus::Pending,
            version: 0,
        })
        .collect::<Vec<_>>();

    for block in &blocks {
        PluginSpec::from_block(block).map_err(|e| {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("block {}: {}", block.position, e),
            )
        })?;
    }

    let session = Session::new(Uuid::new_v4().to_string(), join_code(), req.mode, blocks);
    tracing::info!(
        "Scheduling {} session {} (code {}) with {} blocks",
        session.mode.as_str(),
        session.id,
        session.code,
        session.blocks.len()
    );

    state.remote.create_session(&session).await.map_err(|e| {
        tracing::error!("Failed to create session: {}", e);
        (remote_status(&e), e.to_string())
    })?;

    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /api/v1/live/sessions/{id}/attach
pub async fn attach_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(params): Query<AttachParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::info!("Attaching host console to session {}", session_id);

    let handle = state
        .registry
        .attach(
            state.remote.clone(),
            &session_id,
            params.mode,
            &state.config,
        )
        .await
        .map_err(error_response)?;

    Ok((StatusCode::OK, Json(handle.view())))
}

/// GET /api/v1/live/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = attached(&state, &session_id).await?;
    Ok((StatusCode::OK, Json(handle.view())))
}

/// POST /api/v1/live/sessions/{id}/actions
pub async fn perform_action(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    AppJson(action): AppJson<HostAction>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tracing::info!("Host action {} on session {}", action.name(), session_id);

    let handle = attached(&state, &session_id).await?;
    let performed = handle.perform(action).await.map_err(error_response)?;

    Ok((StatusCode::ACCEPTED, Json(performed.view)))
}

/// DELETE /api/v1/live/sessions/{id}
pub async fn detach_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if state.registry.detach(&session_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "Session not attached".to_string()))
    }
}

pub(crate) async fn attached(
    state: &AppState,
    session_id: &str,
) -> Result<OrchestratorHandle, (StatusCode, String)> {
    state
        .registry
        .get(session_id)
        .await
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Session not attached".to_string()))
}

fn join_code() -> String {
    let mut rng = rand::rng();
    (0..JOIN_CODE_LEN)
        .map(|_| JOIN_CODE_ALPHABET[rng.random_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}
