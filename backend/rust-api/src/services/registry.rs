use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::metrics::SESSIONS_ATTACHED;
use crate::models::SessionMode;
use crate::services::orchestrator::{self, OrchestratorError, OrchestratorHandle};
use crate::services::remote::RemoteStore;

struct Attached {
    handle: OrchestratorHandle,
    task: JoinHandle<()>,
}

/// Running orchestrators by session id. At most one per session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Attached>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running orchestrator, starting one if needed. The
    /// registry lock is not held while the orchestrator loads.
    pub async fn attach(
        &self,
        remote: Arc<dyn RemoteStore>,
        session_id: &str,
        mode: SessionMode,
        config: &Config,
    ) -> Result<OrchestratorHandle, OrchestratorError> {
        if let Some(handle) = self.running(session_id, mode).await {
            return Ok(handle);
        }

        let (handle, task) = orchestrator::spawn(remote, session_id, mode, config).await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(session_id) {
            if !existing.handle.is_closed() && existing.handle.mode() == mode {
                let existing = existing.handle.clone();
                drop(sessions);
                tracing::debug!("Session {} attached concurrently, dropping duplicate", session_id);
                handle.shutdown().await;
                task.abort();
                return Ok(existing);
            }
        }
        if let Some(stale) = sessions.remove(session_id) {
            stale.task.abort();
            SESSIONS_ATTACHED.dec();
        }
        sessions.insert(
            session_id.to_string(),
            Attached {
                handle: handle.clone(),
                task,
            },
        );
        SESSIONS_ATTACHED.inc();
        tracing::info!("Attached session {} ({})", session_id, mode.as_str());
        Ok(handle)
    }

    async fn running(&self, session_id: &str, mode: SessionMode) -> Option<OrchestratorHandle> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .filter(|attached| !attached.handle.is_closed() && attached.handle.mode() == mode)
            .map(|attached| attached.handle.clone())
    }

    pub async fn get(&self, session_id: &str) -> Option<OrchestratorHandle> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .filter(|attached| !attached.handle.is_closed())
            .map(|attached| attached.handle.clone())
    }

    /// Stops the orchestrator and waits for its task to finish. Returns
    /// false when nothing was attached.
    pub async fn detach(&self, session_id: &str) -> bool {
        let Some(attached) = self.sessions.lock().await.remove(session_id) else {
            return false;
        };
        SESSIONS_ATTACHED.dec();
        attached.handle.shutdown().await;
        if let Err(e) = attached.task.await {
            if !e.is_cancelled() {
                tracing::error!("Orchestrator task for session {} failed: {}", session_id, e);
            }
        }
        tracing::info!("Detached session {}", session_id);
        true
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn detach_all(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            self.detach(&id).await;
        }
    }
}
