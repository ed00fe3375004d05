use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;

use crate::metrics;
use crate::services::interaction::InteractionError;
use crate::services::orchestrator::OrchestratorError;
use crate::services::remote::{RemoteError, SessionSource};
use crate::services::AppState;

pub mod interactions;
pub mod live;
pub mod sse;

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut status = "healthy";
    let mut dependencies = serde_json::Map::new();
    let mut all_healthy = true;

    let remote_health = check_remote(&state).await;
    dependencies.insert("remote_store".to_string(), json!(remote_health));
    if remote_health.get("status").and_then(|v| v.as_str()) != Some("healthy") {
        all_healthy = false;
        status = "degraded";
    }

    if state.mongo.is_some() {
        let mongo_health = check_mongodb(&state).await;
        dependencies.insert("mongodb".to_string(), json!(mongo_health));
        if mongo_health.get("status").and_then(|v| v.as_str()) != Some("healthy") {
            all_healthy = false;
            status = "degraded";
        }
    }

    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "lessonplay-api",
            "version": env!("CARGO_PKG_VERSION"),
            "backend": state.config.remote_backend.as_str(),
            "attached_sessions": state.registry.len().await,
            "dependencies": dependencies
        })),
    )
}

async fn check_remote(state: &AppState) -> serde_json::Map<String, serde_json::Value> {
    let mut result = serde_json::Map::new();

    match tokio::time::timeout(std::time::Duration::from_millis(500), state.remote.ping()).await {
        Ok(Ok(())) => {
            result.insert("status".to_string(), json!("healthy"));
            result.insert("message".to_string(), json!("Remote store reachable"));
        }
        Ok(Err(e)) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(e.to_string()));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!("Remote store timeout after 500ms"));
        }
    }

    result
}

async fn check_mongodb(state: &AppState) -> serde_json::Map<String, serde_json::Value> {
    let mut result = serde_json::Map::new();
    let Some(mongo) = &state.mongo else {
        return result;
    };

    match tokio::time::timeout(
        std::time::Duration::from_secs(1),
        mongo.run_command(mongodb::bson::doc! { "ping": 1 }),
    )
    .await
    {
        Ok(Ok(_)) => {
            result.insert("status".to_string(), json!("healthy"));
            result.insert(
                "message".to_string(),
                json!("MongoDB connection successful"),
            );
        }
        Ok(Err(e)) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(format!("MongoDB error: {}", e)));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!("MongoDB timeout after 1s"));
        }
    }

    result
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

pub(crate) fn remote_status(error: &RemoteError) -> StatusCode {
    match error {
        RemoteError::NotFound { .. } => StatusCode::NOT_FOUND,
        RemoteError::Stale { .. } | RemoteError::Rejected(_) => StatusCode::CONFLICT,
        RemoteError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn interaction_status(error: &InteractionError) -> StatusCode {
    match error {
        InteractionError::InvalidPayload(_)
        | InteractionError::InvalidContent(_)
        | InteractionError::Unsupported(_)
        | InteractionError::InvalidReport(_) => StatusCode::UNPROCESSABLE_ENTITY,
        InteractionError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        InteractionError::NoSelection
        | InteractionError::Completed
        | InteractionError::InvalidPhase { .. }
        | InteractionError::NotApplicable { .. } => StatusCode::CONFLICT,
    }
}

/// Maps orchestrator failures onto HTTP statuses.
pub(crate) fn error_response(error: OrchestratorError) -> (StatusCode, String) {
    let status = match &error {
        OrchestratorError::Transition(_) => StatusCode::CONFLICT,
        OrchestratorError::Remote(e) => remote_status(e),
        OrchestratorError::Interaction(e) => interaction_status(e),
        OrchestratorError::Progress(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::Closed => StatusCode::NOT_FOUND,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", error);
    } else {
        tracing::warn!("Request rejected: {}", error);
    }
    (status, error.to_string())
}
