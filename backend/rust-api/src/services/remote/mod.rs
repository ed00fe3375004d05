pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{
    BlockStatus, ChatMode, Command, CommandEnvelope, ControlMode, FeedMessage, PauseReason,
    PlayState, RowUpdate, Session, SessionMode, SessionStatus,
};

pub use memory::MemoryRemoteStore;
pub use redis_store::RedisRemoteStore;

/// Applied command results are kept this long for idempotent retries.
pub(crate) const IDEMPOTENCY_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: String },
    #[error("stale write: expected version {expected}, row is at {actual}")]
    Stale { expected: u64, actual: u64 },
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("remote store unavailable: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Only transport failures are worth retrying with the same command id.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RemoteError::Transport(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            RemoteError::NotFound { .. } => "not_found",
            RemoteError::Stale { .. } => "stale",
            RemoteError::Rejected(_) => "rejected",
            RemoteError::Transport(_) => "transport",
        }
    }
}

/// Durable single-row writes. Each call carries the envelope so the store
/// can check the row version and deduplicate by command id.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn update_session_status(
        &self,
        envelope: &CommandEnvelope,
        status: SessionStatus,
        pause_reason: Option<PauseReason>,
    ) -> Result<RowUpdate, RemoteError>;

    async fn update_play_state(
        &self,
        envelope: &CommandEnvelope,
        play_state: PlayState,
        current_block_id: Option<String>,
        resume_phase: Option<PlayState>,
    ) -> Result<RowUpdate, RemoteError>;

    async fn update_block_status(
        &self,
        envelope: &CommandEnvelope,
        block_id: &str,
        status: BlockStatus,
    ) -> Result<RowUpdate, RemoteError>;

    async fn update_control_mode(
        &self,
        envelope: &CommandEnvelope,
        mode: ControlMode,
    ) -> Result<RowUpdate, RemoteError>;

    async fn update_chat_mode(
        &self,
        envelope: &CommandEnvelope,
        mode: ChatMode,
    ) -> Result<RowUpdate, RemoteError>;

    async fn execute(&self, envelope: &CommandEnvelope) -> Result<RowUpdate, RemoteError> {
        match &envelope.command {
            Command::UpdateSessionStatus {
                status,
                pause_reason,
            } => {
                self.update_session_status(envelope, *status, *pause_reason)
                    .await
            }
            Command::UpdatePlayState {
                play_state,
                current_block_id,
                resume_phase,
            } => {
                self.update_play_state(
                    envelope,
                    *play_state,
                    current_block_id.clone(),
                    *resume_phase,
                )
                .await
            }
            Command::UpdateBlockStatus { block_id, status } => {
                self.update_block_status(envelope, block_id, *status).await
            }
            Command::UpdateControlMode { mode } => self.update_control_mode(envelope, *mode).await,
            Command::UpdateChatMode { mode } => self.update_chat_mode(envelope, *mode).await,
        }
    }
}

/// Push feed of row changes for one session.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// The receiver yields `Connected` once the subscription is live, then
    /// events, and `Disconnected`/`Connected` pairs across reconnects.
    async fn subscribe(
        &self,
        session_id: &str,
        mode: SessionMode,
    ) -> Result<mpsc::Receiver<FeedMessage>, RemoteError>;
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch_session(&self, session_id: &str, mode: SessionMode)
        -> Result<Session, RemoteError>;

    /// Stores a new `draft` session with its blocks.
    async fn create_session(&self, session: &Session) -> Result<(), RemoteError>;

    /// Connectivity check used by the health endpoint.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Everything the orchestrator needs from the remote side.
pub trait RemoteStore: CommandSink + ChangeFeed + SessionSource {}

impl<T: CommandSink + ChangeFeed + SessionSource> RemoteStore for T {}

/// Key prefix for one session's rows, scoped by session mode.
pub fn scope(mode: SessionMode) -> String {
    format!("lp:{}", mode.as_str())
}
