use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::{FEEDS_CONNECTED, FEED_EVENTS_TOTAL, RESYNCS_TOTAL};
use crate::models::{FeedMessage, Session, SessionMode};
use crate::services::remote::{RemoteError, RemoteStore, SessionSource};
use crate::services::session_store::{MergeOutcome, SessionStateStore};
use crate::utils::retry::{retry_async_when, RetryConfig};

/// Snapshot fetched after a (re)connect.
#[derive(Debug)]
pub struct ResyncOutcome {
    pub generation: u64,
    pub result: Result<Session, RemoteError>,
}

/// Keeps the authoritative tier in line with the change feed. Never plans a
/// transition itself.
pub struct Reconciler {
    source: Arc<dyn RemoteStore>,
    session_id: String,
    mode: SessionMode,
    retry: RetryConfig,
    connected: bool,
    generation: u64,
    resync: Option<JoinHandle<()>>,
    resyncs: mpsc::UnboundedSender<ResyncOutcome>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn RemoteStore>,
        session_id: &str,
        mode: SessionMode,
        retry: RetryConfig,
        resyncs: mpsc::UnboundedSender<ResyncOutcome>,
    ) -> Self {
        Self {
            source,
            session_id: session_id.to_string(),
            mode,
            retry,
            connected: false,
            generation: 0,
            resync: None,
            resyncs,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Handles one feed message. Returns true when the authoritative tier or
    /// the connection flag changed.
    pub fn handle(&mut self, store: &mut SessionStateStore, message: FeedMessage) -> bool {
        match message {
            FeedMessage::Connected => {
                tracing::info!("Change feed connected for session {}", self.session_id);
                self.set_connected(true);
                self.start_resync();
                true
            }
            FeedMessage::Disconnected { reason } => {
                tracing::warn!(
                    "Change feed for session {} disconnected: {}",
                    self.session_id,
                    reason
                );
                let was_connected = self.connected;
                self.set_connected(false);
                was_connected
            }
            FeedMessage::Event(event) => {
                let outcome = store.merge_remote(&event);
                let label = match outcome {
                    MergeOutcome::Applied => "applied",
                    MergeOutcome::Stale => "stale",
                    MergeOutcome::Unknown => "unknown",
                };
                FEED_EVENTS_TOTAL
                    .with_label_values(&[event.table.as_str(), label])
                    .inc();
                tracing::debug!(
                    "Feed event {} {} for session {}: {}",
                    event.table.as_str(),
                    event.row_id,
                    self.session_id,
                    label
                );
                outcome == MergeOutcome::Applied
            }
        }
    }

    /// The feed ended for good; treated as a disconnect.
    pub fn feed_closed(&mut self) {
        tracing::warn!("Change feed for session {} closed", self.session_id);
        self.set_connected(false);
    }

    /// Applies a fetched snapshot unless a newer fetch superseded it or the
    /// feed already delivered a newer row.
    pub fn apply_resync(
        &mut self,
        store: &mut SessionStateStore,
        outcome: ResyncOutcome,
    ) -> Result<bool, RemoteError> {
        if outcome.generation != self.generation {
            return Ok(false);
        }
        self.resync = None;

        match outcome.result {
            Ok(snapshot) => {
                if snapshot.version < store.authoritative().version {
                    RESYNCS_TOTAL.with_label_values(&["outdated"]).inc();
                    return Ok(false);
                }
                tracing::info!(
                    "Resynced session {} at version {}",
                    self.session_id,
                    snapshot.version
                );
                RESYNCS_TOTAL.with_label_values(&["success"]).inc();
                store.replace_authoritative(snapshot);
                Ok(true)
            }
            Err(e) => {
                tracing::error!("Resync of session {} failed: {}", self.session_id, e);
                RESYNCS_TOTAL.with_label_values(&["failed"]).inc();
                Err(e)
            }
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.resync.take() {
            task.abort();
        }
        self.set_connected(false);
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        if connected {
            FEEDS_CONNECTED.inc();
        } else {
            FEEDS_CONNECTED.dec();
        }
    }

    fn start_resync(&mut self) {
        if let Some(task) = self.resync.take() {
            task.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let source = self.source.clone();
        let session_id = self.session_id.clone();
        let mode = self.mode;
        let retry = self.retry.clone();
        let resyncs = self.resyncs.clone();

        self.resync = Some(tokio::spawn(async move {
            let result = retry_async_when(retry, RemoteError::is_retriable, || {
                source.fetch_session(&session_id, mode)
            })
            .await;
            let _ = resyncs.send(ResyncOutcome { generation, result });
        }));
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeEvent, PlayState, SessionPatch, SessionStatus};
    use crate::services::remote::MemoryRemoteStore;
    use std::time::Duration;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter_max: None,
        }
    }

    async fn setup() -> (
        Arc<MemoryRemoteStore>,
        SessionStateStore,
        Reconciler,
        mpsc::UnboundedReceiver<ResyncOutcome>,
    ) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let session = Session::new(
            "s-1".to_string(),
            "ABC123".to_string(),
            SessionMode::Live,
            Vec::new(),
        );
        remote.create_session(&session).await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let reconciler = Reconciler::new(remote.clone(), "s-1", SessionMode::Live, retry(), tx);
        (remote, SessionStateStore::new(session), reconciler, rx)
    }

    #[tokio::test]
    async fn connect_triggers_a_resync_that_replaces_the_snapshot() {
        let (remote, mut store, mut reconciler, mut resyncs) = setup().await;
        remote
            .apply_external(
                "s-1",
                SessionMode::Live,
                SessionPatch {
                    status: Some(SessionStatus::Waiting),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(reconciler.handle(&mut store, FeedMessage::Connected));
        assert!(reconciler.is_connected());

        let outcome = resyncs.recv().await.unwrap();
        assert_eq!(reconciler.apply_resync(&mut store, outcome), Ok(true));
        assert_eq!(store.authoritative().status, SessionStatus::Waiting);
        assert_eq!(store.authoritative().version, 1);
    }

    #[tokio::test]
    async fn failed_fetches_are_retried() {
        let (remote, mut store, mut reconciler, mut resyncs) = setup().await;
        remote.fail_next_fetches(2).await;

        reconciler.handle(&mut store, FeedMessage::Connected);
        let outcome = resyncs.recv().await.unwrap();
        assert_eq!(reconciler.apply_resync(&mut store, outcome), Ok(true));
    }

    #[tokio::test]
    async fn superseded_resyncs_are_dropped() {
        let (_remote, mut store, mut reconciler, mut resyncs) = setup().await;
        reconciler.handle(&mut store, FeedMessage::Connected);
        reconciler.handle(
            &mut store,
            FeedMessage::Disconnected {
                reason: "reset".to_string(),
            },
        );
        reconciler.handle(&mut store, FeedMessage::Connected);

        let outcome = resyncs.recv().await.unwrap();
        assert_eq!(outcome.generation, 2);
        assert_eq!(reconciler.apply_resync(&mut store, outcome), Ok(true));

        let stale = ResyncOutcome {
            generation: 1,
            result: Err(RemoteError::Transport("late".to_string())),
        };
        assert_eq!(reconciler.apply_resync(&mut store, stale), Ok(false));
    }

    #[tokio::test]
    async fn disconnect_keeps_optimistic_entries() {
        let (_remote, mut store, mut reconciler, _resyncs) = setup().await;
        reconciler.handle(&mut store, FeedMessage::Connected);
        store.apply_optimistic(
            "c-1",
            crate::models::RowChange::Session(SessionPatch {
                status: Some(SessionStatus::Waiting),
                ..Default::default()
            }),
        );

        reconciler.handle(
            &mut store,
            FeedMessage::Disconnected {
                reason: "reset".to_string(),
            },
        );
        assert!(!reconciler.is_connected());
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.view().status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn events_merge_without_changing_phase_on_their_own() {
        let (_remote, mut store, mut reconciler, _resyncs) = setup().await;
        let event = ChangeEvent::session(
            "s-1",
            &SessionPatch {
                chat_mode: Some(crate::models::ChatMode::Disabled),
                version: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(reconciler.handle(&mut store, FeedMessage::Event(event.clone())));
        assert!(reconciler.handle(&mut store, FeedMessage::Event(event)));
        assert_eq!(store.authoritative().phase, None::<PlayState>);
        assert_eq!(store.authoritative().version, 1);
    }
}
