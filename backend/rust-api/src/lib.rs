use axum::{
    http::{header, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub mod config;
pub mod extractors;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: Arc<services::AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api/v1/live", live_routes())
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(middleware::from_fn(
            middlewares::trace::trace_context_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

fn live_routes() -> Router<Arc<services::AppState>> {
    // The SSE route stays uncompressed so events are flushed as they happen.
    let stream = Router::new().route(
        "/sessions/{id}/stream",
        get(handlers::sse::session_stream),
    );

    Router::new()
        .route("/sessions", post(handlers::live::create_session))
        .route(
            "/sessions/{id}",
            get(handlers::live::get_session).delete(handlers::live::detach_session),
        )
        .route("/sessions/{id}/attach", post(handlers::live::attach_session))
        .route("/sessions/{id}/actions", post(handlers::live::perform_action))
        .route(
            "/sessions/{id}/blocks/{block_id}/interactions",
            get(handlers::interactions::list_interactions),
        )
        .route(
            "/sessions/{id}/blocks/{block_id}/interactions/{participant_id}",
            post(handlers::interactions::apply_interaction),
        )
        .layer(CompressionLayer::new())
        .merge(stream)
}
