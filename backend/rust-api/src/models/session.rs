use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::block::{Block, BlockStatus};
use super::nullable;
use super::play_state::PlayState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Test,
    #[default]
    Live,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Test => "test",
            SessionMode::Live => "live",
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "test" => Ok(SessionMode::Test),
            "live" => Ok(SessionMode::Live),
            _ => Err(format!("Invalid session mode: {}", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    Waiting,
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Draft => "draft",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ended => "ended",
        }
    }

    /// Statuses that carry no play phase.
    pub fn is_pre_start(&self) -> bool {
        matches!(self, SessionStatus::Draft | SessionStatus::Waiting)
    }

    /// Phase transitions are only accepted while running or paused.
    pub fn accepts_phase_transitions(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Draft, SessionStatus::Waiting)
                | (SessionStatus::Draft, SessionStatus::Active)
                | (SessionStatus::Waiting, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Paused)
                | (SessionStatus::Paused, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Ended)
                | (SessionStatus::Paused, SessionStatus::Ended)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    #[default]
    HostOnly,
    Hybrid,
    ParticipantPaced,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    #[default]
    Enabled,
    Moderated,
    Disabled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    TechnicalIssue,
    Break,
    ContentReview,
    Other,
}

/// Canonical state of one live session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub code: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    #[serde(default)]
    pub phase: Option<PlayState>,
    /// Phase to restore when leaving `paused`/`host_segment`.
    #[serde(default)]
    pub resume_phase: Option<PlayState>,
    #[serde(default)]
    pub control_mode: ControlMode,
    #[serde(default)]
    pub chat_mode: ChatMode,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub current_block_id: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl Session {
    pub fn new(id: String, code: String, mode: SessionMode, mut blocks: Vec<Block>) -> Self {
        blocks.sort_by_key(|block| block.position);
        Self {
            id,
            code,
            mode,
            status: SessionStatus::Draft,
            phase: None,
            resume_phase: None,
            control_mode: ControlMode::default(),
            chat_mode: ChatMode::default(),
            pause_reason: None,
            blocks,
            current_block_id: None,
            version: 0,
        }
    }

    pub fn cursor(&self) -> Option<usize> {
        let current = self.current_block_id.as_deref()?;
        self.blocks.iter().position(|block| block.id == current)
    }

    pub fn current_block(&self) -> Option<&Block> {
        self.cursor().and_then(|index| self.blocks.get(index))
    }

    /// Block after the cursor, or the first block when nothing is current yet.
    pub fn next_block(&self) -> Option<&Block> {
        match self.cursor() {
            Some(index) => self.blocks.get(index + 1),
            None => self.blocks.first(),
        }
    }

    pub fn block(&self, block_id: &str) -> Option<&Block> {
        self.blocks.iter().find(|block| block.id == block_id)
    }

    pub fn block_mut(&mut self, block_id: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|block| block.id == block_id)
    }

    /// Checks the phase/status coupling rules; returns a description of the
    /// first violation.
    pub fn invariant_violation(&self) -> Option<String> {
        if self.status.is_pre_start() && self.phase.is_some() {
            return Some(format!(
                "phase {:?} set while status is {}",
                self.phase,
                self.status.as_str()
            ));
        }
        if !self.status.is_pre_start() && self.phase.is_none() {
            return Some(format!("phase missing while status is {}", self.status.as_str()));
        }
        if self.pause_reason.is_some() && self.status != SessionStatus::Paused {
            return Some("pause reason set on a session that is not paused".to_string());
        }
        None
    }

    /// Merges the fields present in `patch`; absent fields are left alone.
    pub fn apply_patch(&mut self, patch: &SessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(phase) = patch.phase {
            self.phase = phase;
        }
        if let Some(resume_phase) = patch.resume_phase {
            self.resume_phase = resume_phase;
        }
        if let Some(pause_reason) = patch.pause_reason {
            self.pause_reason = pause_reason;
        }
        if let Some(control_mode) = patch.control_mode {
            self.control_mode = control_mode;
        }
        if let Some(chat_mode) = patch.chat_mode {
            self.chat_mode = chat_mode;
        }
        if let Some(current_block_id) = &patch.current_block_id {
            self.current_block_id = current_block_id.clone();
        }
        if let Some(version) = patch.version {
            self.version = version;
        }
    }

    pub fn apply_block_patch(&mut self, block_id: &str, patch: &BlockPatch) -> bool {
        let Some(block) = self.block_mut(block_id) else {
            return false;
        };
        if let Some(status) = patch.status {
            block.status = status;
        }
        if let Some(version) = patch.version {
            block.version = version;
        }
        true
    }
}

/// Partial session row. `None` means "field not present"; for nullable
/// columns `Some(None)` means "set to null".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(
        default,
        deserialize_with = "nullable::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub phase: Option<Option<PlayState>>,
    #[serde(
        default,
        deserialize_with = "nullable::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub resume_phase: Option<Option<PlayState>>,
    #[serde(
        default,
        deserialize_with = "nullable::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub pause_reason: Option<Option<PauseReason>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_mode: Option<ControlMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_mode: Option<ChatMode>,
    #[serde(
        default,
        deserialize_with = "nullable::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub current_block_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self == &SessionPatch::default()
    }

    /// Same patch with the row version stripped, used for optimistic overlays.
    pub fn without_version(&self) -> Self {
        Self {
            version: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BlockPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BlockStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session::new(
            "s-1".to_string(),
            "ABC123".to_string(),
            SessionMode::Live,
            vec![
                Block {
                    id: "b-2".to_string(),
                    position: 2,
                    plugin: "true_false".to_string(),
                    content: json!({"correct": true}),
                    settings: Default::default(),
                    status: BlockStatus::Pending,
                    version: 0,
                },
                Block {
                    id: "b-1".to_string(),
                    position: 1,
                    plugin: "true_false".to_string(),
                    content: json!({"correct": false}),
                    settings: Default::default(),
                    status: BlockStatus::Pending,
                    version: 0,
                },
            ],
        )
    }

    #[test]
    fn new_session_orders_blocks_and_satisfies_invariants() {
        let session = session();
        assert_eq!(session.blocks[0].id, "b-1");
        assert_eq!(session.status, SessionStatus::Draft);
        assert!(session.invariant_violation().is_none());
        assert_eq!(session.next_block().map(|b| b.id.as_str()), Some("b-1"));
    }

    #[test]
    fn cursor_follows_current_block_id() {
        let mut session = session();
        session.current_block_id = Some("b-2".to_string());
        assert_eq!(session.cursor(), Some(1));
        assert!(session.next_block().is_none());
    }

    #[test]
    fn patch_distinguishes_absent_from_null() {
        let patch: SessionPatch =
            serde_json::from_value(json!({"phase": null, "status": "waiting"})).unwrap();
        assert_eq!(patch.phase, Some(None));
        assert_eq!(patch.resume_phase, None);

        let mut session = session();
        session.phase = Some(PlayState::Lobby);
        session.resume_phase = Some(PlayState::Lobby);
        session.apply_patch(&patch);
        assert_eq!(session.phase, None);
        assert_eq!(session.resume_phase, Some(PlayState::Lobby));
        assert_eq!(session.status, SessionStatus::Waiting);
    }

    #[test]
    fn patch_serializes_only_present_fields() {
        let patch = SessionPatch {
            pause_reason: Some(None),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({"pause_reason": null}));
    }

    #[test]
    fn status_graph() {
        assert!(SessionStatus::Draft.can_transition_to(SessionStatus::Waiting));
        assert!(SessionStatus::Waiting.can_transition_to(SessionStatus::Active));
        assert!(SessionStatus::Paused.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Ended.can_transition_to(SessionStatus::Active));
        assert!(!SessionStatus::Draft.can_transition_to(SessionStatus::Paused));
    }

    #[test]
    fn invariant_flags_missing_phase_when_active() {
        let mut session = session();
        session.status = SessionStatus::Active;
        assert!(session.invariant_violation().is_some());
        session.phase = Some(PlayState::Lobby);
        assert!(session.invariant_violation().is_none());
    }
}
