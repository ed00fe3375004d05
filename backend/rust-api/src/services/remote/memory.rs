use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::Instant;

use super::{ChangeFeed, CommandSink, RemoteError, SessionSource, IDEMPOTENCY_TTL};
use crate::models::{
    BlockStatus, ChangeEvent, ChatMode, CommandEnvelope, ControlMode, FeedMessage, PauseReason,
    PlayState, RowChange, RowUpdate, Session, SessionMode, SessionPatch, SessionStatus,
};

type RowKey = (SessionMode, String);

#[derive(Default)]
struct State {
    sessions: HashMap<RowKey, Session>,
    applied: HashMap<String, Result<RowUpdate, RemoteError>>,
    applied_order: VecDeque<(Instant, String)>,
    fail_writes: VecDeque<RemoteError>,
    fail_fetches: usize,
    feed_down: HashSet<RowKey>,
}

impl State {
    fn remember(&mut self, command_id: &str, result: Result<RowUpdate, RemoteError>) {
        self.applied.insert(command_id.to_string(), result);
        self.applied_order
            .push_back((Instant::now(), command_id.to_string()));
    }

    /// Drops cached results older than the idempotency window.
    fn forget_expired(&mut self) {
        while let Some((at, _)) = self.applied_order.front() {
            if at.elapsed() < IDEMPOTENCY_TTL {
                break;
            }
            if let Some((_, command_id)) = self.applied_order.pop_front() {
                self.applied.remove(&command_id);
            }
        }
    }
}

/// In-process remote store. Backs the `memory` backend and the test suite;
/// failures, held writes and feed outages can be injected.
pub struct MemoryRemoteStore {
    state: Mutex<State>,
    events: broadcast::Sender<(RowKey, FeedMessage)>,
    gate: watch::Sender<bool>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::default()),
            events,
            gate,
        }
    }

    /// Makes the next write fail with `error`.
    pub async fn fail_next_write(&self, error: RemoteError) {
        self.state.lock().await.fail_writes.push_back(error);
    }

    /// Makes the next `count` snapshot fetches fail with a transport error.
    pub async fn fail_next_fetches(&self, count: usize) {
        self.state.lock().await.fail_fetches = count;
    }

    /// Writes wait until `release_writes` is called.
    pub fn hold_writes(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(true);
    }

    /// Drops the feed for one session: subscribers see `Disconnected` and
    /// changes made meanwhile are never delivered.
    pub async fn disconnect_feed(&self, session_id: &str, mode: SessionMode) {
        let key = (mode, session_id.to_string());
        self.state.lock().await.feed_down.insert(key.clone());
        let _ = self.events.send((
            key,
            FeedMessage::Disconnected {
                reason: "connection reset".to_string(),
            },
        ));
    }

    pub async fn reconnect_feed(&self, session_id: &str, mode: SessionMode) {
        let key = (mode, session_id.to_string());
        self.state.lock().await.feed_down.remove(&key);
        let _ = self.events.send((key, FeedMessage::Connected));
    }

    /// Applies a change as if another writer had made it.
    pub async fn apply_external(
        &self,
        session_id: &str,
        mode: SessionMode,
        patch: SessionPatch,
    ) -> Result<RowUpdate, RemoteError> {
        let key = (mode, session_id.to_string());
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&key)
            .ok_or_else(|| not_found("sessions", session_id))?;
        session.version += 1;
        let versioned = SessionPatch {
            version: Some(session.version),
            ..patch
        };
        session.apply_patch(&versioned);
        let event = ChangeEvent::session(session_id, &versioned)
            .map_err(|e| RemoteError::Rejected(e.to_string()))?;
        if !state.feed_down.contains(&key) {
            let _ = self.events.send((key, FeedMessage::Event(event.clone())));
        }
        Ok(event)
    }

    pub async fn snapshot(&self, session_id: &str, mode: SessionMode) -> Option<Session> {
        self.state
            .lock()
            .await
            .sessions
            .get(&(mode, session_id.to_string()))
            .cloned()
    }

    async fn write(&self, envelope: &CommandEnvelope) -> Result<RowUpdate, RemoteError> {
        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(RemoteError::Transport("store shut down".to_string()));
        }

        let mut state = self.state.lock().await;
        state.forget_expired();
        if let Some(previous) = state.applied.get(&envelope.command_id) {
            return previous.clone();
        }
        if let Some(error) = state.fail_writes.pop_front() {
            // Transport failures never reached the row, so they are not cached.
            if !error.is_retriable() {
                state.remember(&envelope.command_id, Err(error.clone()));
            }
            return Err(error);
        }

        let key = (envelope.mode, envelope.session_id.clone());
        let result = match state.sessions.get_mut(&key) {
            Some(session) => apply_command(session, envelope),
            None => Err(not_found("sessions", &envelope.session_id)),
        };
        state.remember(&envelope.command_id, result.clone());

        if let Ok(event) = &result {
            if !state.feed_down.contains(&key) {
                let _ = self.events.send((key, FeedMessage::Event(event.clone())));
            }
        }
        result
    }
}

fn not_found(table: &'static str, id: &str) -> RemoteError {
    RemoteError::NotFound {
        table,
        id: id.to_string(),
    }
}

fn check_version(expected: Option<u64>, actual: u64) -> Result<(), RemoteError> {
    match expected {
        Some(expected) if expected != actual => Err(RemoteError::Stale { expected, actual }),
        _ => Ok(()),
    }
}

/// Applies one command to a stored row: version check, merge, version bump.
pub(crate) fn apply_command(
    session: &mut Session,
    envelope: &CommandEnvelope,
) -> Result<RowUpdate, RemoteError> {
    match envelope.command.patch() {
        RowChange::Session(patch) => {
            check_version(envelope.expected_version, session.version)?;
            if let Some(status) = patch.status {
                if status != session.status && !session.status.can_transition_to(status) {
                    return Err(RemoteError::Rejected(format!(
                        "status {} cannot move to {}",
                        session.status.as_str(),
                        status.as_str()
                    )));
                }
            }
            session.version += 1;
            let versioned = SessionPatch {
                version: Some(session.version),
                ..patch
            };
            session.apply_patch(&versioned);
            ChangeEvent::session(&session.id, &versioned)
                .map_err(|e| RemoteError::Rejected(e.to_string()))
        }
        RowChange::Block { block_id, patch } => {
            let block = session
                .block_mut(&block_id)
                .ok_or_else(|| not_found("blocks", &block_id))?;
            check_version(envelope.expected_version, block.version)?;
            block.version += 1;
            let versioned = crate::models::BlockPatch {
                version: Some(block.version),
                ..patch
            };
            if let Some(status) = versioned.status {
                block.status = status;
            }
            ChangeEvent::block(&block_id, &versioned)
                .map_err(|e| RemoteError::Rejected(e.to_string()))
        }
    }
}

#[async_trait]
impl CommandSink for MemoryRemoteStore {
    async fn update_session_status(
        &self,
        envelope: &CommandEnvelope,
        _status: SessionStatus,
        _pause_reason: Option<PauseReason>,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await
    }

    async fn update_play_state(
        &self,
        envelope: &CommandEnvelope,
        _play_state: PlayState,
        _current_block_id: Option<String>,
        _resume_phase: Option<PlayState>,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await
    }

    async fn update_block_status(
        &self,
        envelope: &CommandEnvelope,
        _block_id: &str,
        _status: BlockStatus,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await
    }

    async fn update_control_mode(
        &self,
        envelope: &CommandEnvelope,
        _mode: ControlMode,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await
    }

    async fn update_chat_mode(
        &self,
        envelope: &CommandEnvelope,
        _mode: ChatMode,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await
    }
}

#[async_trait]
impl ChangeFeed for MemoryRemoteStore {
    async fn subscribe(
        &self,
        session_id: &str,
        mode: SessionMode,
    ) -> Result<mpsc::Receiver<FeedMessage>, RemoteError> {
        let key = (mode, session_id.to_string());
        let mut events = self.events.subscribe();
        let connected = !self.state.lock().await.feed_down.contains(&key);
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            if connected && tx.send(FeedMessage::Connected).await.is_err() {
                return;
            }
            loop {
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = events.recv() => received,
                };
                match received {
                    Ok((event_key, message)) if event_key == key => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed events: force the subscriber to resync.
                        let reason = format!("lagged by {} events", skipped);
                        if tx.send(FeedMessage::Disconnected { reason }).await.is_err()
                            || tx.send(FeedMessage::Connected).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl SessionSource for MemoryRemoteStore {
    async fn fetch_session(
        &self,
        session_id: &str,
        mode: SessionMode,
    ) -> Result<Session, RemoteError> {
        let mut state = self.state.lock().await;
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(RemoteError::Transport("fetch failed".to_string()));
        }
        state
            .sessions
            .get(&(mode, session_id.to_string()))
            .cloned()
            .ok_or_else(|| not_found("sessions", session_id))
    }

    async fn create_session(&self, session: &Session) -> Result<(), RemoteError> {
        let key = (session.mode, session.id.clone());
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&key) {
            return Err(RemoteError::Rejected(format!(
                "session {} already exists",
                session.id
            )));
        }
        state.sessions.insert(key, session.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}
