use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::block::BlockStatus;
use super::feed::{FeedTable, RowChange};
use super::play_state::PlayState;
use super::session::{
    BlockPatch, ChatMode, ControlMode, PauseReason, SessionMode, SessionPatch, SessionStatus,
};

/// A durable write against one row of the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    UpdateSessionStatus {
        status: SessionStatus,
        pause_reason: Option<PauseReason>,
    },
    UpdatePlayState {
        play_state: PlayState,
        current_block_id: Option<String>,
        resume_phase: Option<PlayState>,
    },
    UpdateBlockStatus {
        block_id: String,
        status: BlockStatus,
    },
    UpdateControlMode {
        mode: ControlMode,
    },
    UpdateChatMode {
        mode: ChatMode,
    },
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::UpdateSessionStatus { .. } => "update_session_status",
            Command::UpdatePlayState { .. } => "update_play_state",
            Command::UpdateBlockStatus { .. } => "update_block_status",
            Command::UpdateControlMode { .. } => "update_control_mode",
            Command::UpdateChatMode { .. } => "update_chat_mode",
        }
    }

    pub fn table(&self) -> FeedTable {
        match self {
            Command::UpdateBlockStatus { .. } => FeedTable::Blocks,
            _ => FeedTable::Sessions,
        }
    }

    /// Fields this command writes, without a row version.
    pub fn patch(&self) -> RowChange {
        match self {
            Command::UpdateSessionStatus {
                status,
                pause_reason,
            } => RowChange::Session(SessionPatch {
                status: Some(*status),
                pause_reason: Some(*pause_reason),
                ..Default::default()
            }),
            Command::UpdatePlayState {
                play_state,
                current_block_id,
                resume_phase,
            } => RowChange::Session(SessionPatch {
                phase: Some(Some(*play_state)),
                current_block_id: Some(current_block_id.clone()),
                resume_phase: Some(*resume_phase),
                ..Default::default()
            }),
            Command::UpdateBlockStatus { block_id, status } => RowChange::Block {
                block_id: block_id.clone(),
                patch: BlockPatch {
                    status: Some(*status),
                    version: None,
                },
            },
            Command::UpdateControlMode { mode } => RowChange::Session(SessionPatch {
                control_mode: Some(*mode),
                ..Default::default()
            }),
            Command::UpdateChatMode { mode } => RowChange::Session(SessionPatch {
                chat_mode: Some(*mode),
                ..Default::default()
            }),
        }
    }
}

/// Command plus what the store needs to apply it idempotently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    /// Row version the write was planned against; `None` skips the check.
    pub expected_version: Option<u64>,
    pub command: Command,
}

impl CommandEnvelope {
    pub fn new(session_id: &str, mode: SessionMode, command: Command) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            mode,
            expected_version: None,
            command,
        }
    }

    /// Id of the row written: the session or the block.
    pub fn row_id(&self) -> &str {
        match &self.command {
            Command::UpdateBlockStatus { block_id, .. } => block_id,
            _ => &self.session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_patch_sets_status_and_reason() {
        let command = Command::UpdateSessionStatus {
            status: SessionStatus::Paused,
            pause_reason: Some(PauseReason::TechnicalIssue),
        };
        match command.patch() {
            RowChange::Session(patch) => {
                assert_eq!(patch.status, Some(SessionStatus::Paused));
                assert_eq!(patch.pause_reason, Some(Some(PauseReason::TechnicalIssue)));
                assert_eq!(patch.phase, None);
            }
            other => panic!("unexpected patch {:?}", other),
        }
    }

    #[test]
    fn block_commands_target_block_rows() {
        let envelope = CommandEnvelope::new(
            "s-1",
            SessionMode::Live,
            Command::UpdateBlockStatus {
                block_id: "b-9".to_string(),
                status: BlockStatus::Skipped,
            },
        );
        assert_eq!(envelope.row_id(), "b-9");
        assert_eq!(envelope.command.table(), FeedTable::Blocks);
        assert_eq!(envelope.command.label(), "update_block_status");
    }

    #[test]
    fn command_serializes_with_type_tag() {
        let json = serde_json::to_value(Command::UpdateChatMode {
            mode: ChatMode::Disabled,
        })
        .unwrap();
        assert_eq!(json["type"], "update_chat_mode");
        assert_eq!(json["mode"], "disabled");
    }
}
