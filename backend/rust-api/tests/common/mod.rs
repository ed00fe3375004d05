#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use lessonplay_api::{
    config::Config,
    create_router,
    models::{
        Block, BlockSettings, BlockStatus, HostAction, PlayState, Session, SessionMode,
        SessionView,
    },
    services::{
        interaction_store::MemoryInteractionStore,
        orchestrator::{self, OrchestratorHandle},
        remote::{MemoryRemoteStore, SessionSource},
        AppState,
    },
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower::ServiceExt;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Router over the in-memory backend, plus the shared state for assertions.
pub fn create_test_app() -> (Router, Arc<AppState>) {
    init_tracing();
    let state = Arc::new(AppState::in_memory(Config::for_tests()));
    (create_router(state.clone()), state)
}

/// Same as `create_test_app`, but the caller keeps the remote store to
/// inject failures and feed outages.
pub fn create_test_app_with(remote: Arc<MemoryRemoteStore>) -> (Router, Arc<AppState>) {
    init_tracing();
    let state = Arc::new(AppState::with_stores(
        Config::for_tests(),
        remote,
        Arc::new(MemoryInteractionStore::default()),
    ));
    (create_router(state.clone()), state)
}

pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

/// Two-question lesson used across the suites.
pub fn lesson_blocks() -> Value {
    json!([
        {
            "plugin": "text_input",
            "content": {"prompt": "Capital of France?", "accepted": ["paris"]}
        },
        {
            "plugin": "true_false",
            "content": {"statement": "The Seine flows through Paris", "correct": true}
        }
    ])
}

/// Schedules a session over HTTP and returns its id.
pub async fn create_session(app: &Router) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/live/sessions",
        Some(json!({"blocks": lesson_blocks()})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {}", body);
    body["id"].as_str().unwrap().to_string()
}

pub async fn attach_session(app: &Router, session_id: &str) -> Value {
    let (status, body) = send(
        app,
        "POST",
        &format!("/api/v1/live/sessions/{}/attach", session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "attach failed: {}", body);
    body
}

pub fn block(id: &str, position: u32, plugin: &str, content: Value) -> Block {
    Block {
        id: id.to_string(),
        position,
        plugin: plugin.to_string(),
        content,
        settings: BlockSettings::default(),
        status: BlockStatus::Pending,
        version: 0,
    }
}

/// The two blocks `seed_session` stores.
pub fn quiz_blocks() -> Vec<Block> {
    vec![
        block("b-capital", 0, "text_input", json!({"accepted": ["paris"]})),
        block("b-river", 1, "true_false", json!({"correct": true})),
    ]
}

/// Stores a two-block draft session directly in the remote store.
pub async fn seed_session(remote: &MemoryRemoteStore, session_id: &str) -> Session {
    seed_session_with(remote, session_id, quiz_blocks()).await
}

pub async fn seed_session_with(
    remote: &MemoryRemoteStore,
    session_id: &str,
    blocks: Vec<Block>,
) -> Session {
    let session = Session::new(
        session_id.to_string(),
        "QUIZ01".to_string(),
        SessionMode::Live,
        blocks,
    );
    remote.create_session(&session).await.unwrap();
    session
}

/// Seeds a session, spawns its orchestrator and starts it into the lobby.
pub async fn live_session(
    remote: Arc<MemoryRemoteStore>,
    session_id: &str,
) -> (OrchestratorHandle, JoinHandle<()>) {
    live_session_with(remote, session_id, quiz_blocks()).await
}

pub async fn live_session_with(
    remote: Arc<MemoryRemoteStore>,
    session_id: &str,
    blocks: Vec<Block>,
) -> (OrchestratorHandle, JoinHandle<()>) {
    seed_session_with(&remote, session_id, blocks).await;
    let (handle, task) = orchestrator::spawn(
        remote,
        session_id,
        SessionMode::Live,
        &Config::for_tests(),
    )
    .await
    .unwrap();
    perform_confirmed(&handle, HostAction::StartSession).await;
    assert_eq!(handle.view().session.phase, Some(PlayState::Lobby));
    (handle, task)
}

pub async fn perform_confirmed(handle: &OrchestratorHandle, action: HostAction) -> SessionView {
    let performed = handle.perform(action).await.unwrap();
    let view = performed.view.clone();
    performed.confirmed().await.unwrap();
    view
}

/// Waits until the published view satisfies `predicate`.
pub async fn wait_for_view<F>(handle: &OrchestratorHandle, predicate: F) -> SessionView
where
    F: Fn(&SessionView) -> bool,
{
    let mut views = handle.watch();
    let waited = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            {
                let view = views.borrow_and_update();
                if predicate(&view) {
                    return view.clone();
                }
            }
            views.changed().await.expect("orchestrator stopped");
        }
    })
    .await;
    waited.expect("view never reached the expected state")
}
