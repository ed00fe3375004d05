use serde::{Deserialize, Serialize};

use super::session::{ChatMode, ControlMode, PauseReason};

/// Host-issued request against a live session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HostAction {
    /// draft → waiting
    OpenLobby,
    /// draft|waiting → active, phase `lobby`
    StartSession,
    /// lobby → countdown
    Begin,
    /// intro|intermission → question_active
    StartQuestion,
    /// question_active → question_soft_locked
    LockQuestion,
    /// question_soft_locked → question_locked without waiting for the grace period
    FinalizeLock,
    ShowResults,
    ShowLeaderboard,
    /// leaderboard → intermission, or final_results when no block is left
    NextBlock,
    ShowPrizes,
    ClosePrizes,
    SkipBlock,
    PauseSession { reason: PauseReason },
    ResumeSession,
    StartHostSegment,
    EndHostSegment,
    /// final_results → ended
    EndSession,
    SetControlMode { mode: ControlMode },
    SetChatMode { mode: ChatMode },
}

impl HostAction {
    pub fn name(&self) -> &'static str {
        match self {
            HostAction::OpenLobby => "open_lobby",
            HostAction::StartSession => "start_session",
            HostAction::Begin => "begin",
            HostAction::StartQuestion => "start_question",
            HostAction::LockQuestion => "lock_question",
            HostAction::FinalizeLock => "finalize_lock",
            HostAction::ShowResults => "show_results",
            HostAction::ShowLeaderboard => "show_leaderboard",
            HostAction::NextBlock => "next_block",
            HostAction::ShowPrizes => "show_prizes",
            HostAction::ClosePrizes => "close_prizes",
            HostAction::SkipBlock => "skip_block",
            HostAction::PauseSession { .. } => "pause_session",
            HostAction::ResumeSession => "resume_session",
            HostAction::StartHostSegment => "start_host_segment",
            HostAction::EndHostSegment => "end_host_segment",
            HostAction::EndSession => "end_session",
            HostAction::SetControlMode { .. } => "set_control_mode",
            HostAction::SetChatMode { .. } => "set_chat_mode",
        }
    }

    /// One representative of every action, used to compute the legal set.
    pub fn catalogue() -> Vec<HostAction> {
        vec![
            HostAction::OpenLobby,
            HostAction::StartSession,
            HostAction::Begin,
            HostAction::StartQuestion,
            HostAction::LockQuestion,
            HostAction::FinalizeLock,
            HostAction::ShowResults,
            HostAction::ShowLeaderboard,
            HostAction::NextBlock,
            HostAction::ShowPrizes,
            HostAction::ClosePrizes,
            HostAction::SkipBlock,
            HostAction::PauseSession {
                reason: PauseReason::Other,
            },
            HostAction::ResumeSession,
            HostAction::StartHostSegment,
            HostAction::EndHostSegment,
            HostAction::EndSession,
            HostAction::SetControlMode {
                mode: ControlMode::HostOnly,
            },
            HostAction::SetChatMode {
                mode: ChatMode::Enabled,
            },
        ]
    }
}
