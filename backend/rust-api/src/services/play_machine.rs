//! Pure planning of session transitions.
//!
//! `plan` validates a trigger against the effective session and returns the
//! ordered commands that realise it. Nothing here touches I/O, so the same
//! function backs both action handling and the legal-action list shown to
//! the host.

use thiserror::Error;

use crate::models::play_state::phase_label;
use crate::models::timer::TimerKind;
use crate::models::{
    BlockStatus, Command, HostAction, PauseReason, PlayState, Session, SessionStatus,
};

/// What asked for a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Host(HostAction),
    Timer(TimerKind),
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Host(action) => action.name(),
            Trigger::Timer(kind) => kind.as_str(),
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            Trigger::Host(_) => "host",
            Trigger::Timer(_) => "timer",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{trigger} is not legal from {from}")]
    Illegal {
        trigger: &'static str,
        from: &'static str,
    },
    #[error("{trigger} requires an active session (status is {status})")]
    StatusGate {
        trigger: &'static str,
        status: &'static str,
    },
    #[error("session is already suspended in {0}")]
    AlreadySuspended(&'static str),
    #[error("session is not suspended in {0}")]
    NotSuspended(&'static str),
}

/// Commands to dispatch, in order, plus where they leave the session.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub trigger: &'static str,
    pub from: Option<PlayState>,
    pub entered: Option<PlayState>,
    pub commands: Vec<Command>,
}

impl TransitionPlan {
    fn new(trigger: &Trigger, session: &Session) -> Self {
        Self {
            trigger: trigger.name(),
            from: session.phase,
            entered: session.phase,
            commands: Vec::new(),
        }
    }

    fn status(mut self, status: SessionStatus, pause_reason: Option<PauseReason>) -> Self {
        self.commands.push(Command::UpdateSessionStatus {
            status,
            pause_reason,
        });
        self
    }

    fn phase(
        mut self,
        play_state: PlayState,
        current_block_id: Option<String>,
        resume_phase: Option<PlayState>,
    ) -> Self {
        self.entered = Some(play_state);
        self.commands.push(Command::UpdatePlayState {
            play_state,
            current_block_id,
            resume_phase,
        });
        self
    }

    fn block(mut self, block_id: &str, status: BlockStatus) -> Self {
        self.commands.push(Command::UpdateBlockStatus {
            block_id: block_id.to_string(),
            status,
        });
        self
    }

    pub fn changes_phase(&self) -> bool {
        self.from != self.entered
    }

    /// Timer the entered phase arms, if it arms one unconditionally.
    pub fn arms(&self) -> Option<TimerKind> {
        match self.entered? {
            PlayState::Countdown => Some(TimerKind::Countdown),
            PlayState::QuestionSoftLocked => Some(TimerKind::SoftLockGrace),
            PlayState::BlockSkipped => Some(TimerKind::SkipDisplay),
            _ => None,
        }
    }
}

pub fn plan(session: &Session, trigger: &Trigger) -> Result<TransitionPlan, TransitionError> {
    let base = TransitionPlan::new(trigger, session);
    let cursor = session.current_block_id.clone();

    match trigger {
        Trigger::Host(HostAction::OpenLobby) => {
            require_status_move(session, trigger, SessionStatus::Waiting)?;
            Ok(base.status(SessionStatus::Waiting, None))
        }
        Trigger::Host(HostAction::StartSession) => {
            if !session.status.is_pre_start() {
                return Err(illegal(trigger, session));
            }
            require_status_move(session, trigger, SessionStatus::Active)?;
            require_edge(session, trigger, PlayState::Lobby)?;
            Ok(base
                .status(SessionStatus::Active, None)
                .phase(PlayState::Lobby, None, None))
        }
        Trigger::Host(HostAction::SetControlMode { mode }) => {
            require_live(session, trigger)?;
            Ok(TransitionPlan {
                commands: vec![Command::UpdateControlMode { mode: *mode }],
                ..base
            })
        }
        Trigger::Host(HostAction::SetChatMode { mode }) => {
            require_live(session, trigger)?;
            Ok(TransitionPlan {
                commands: vec![Command::UpdateChatMode { mode: *mode }],
                ..base
            })
        }
        Trigger::Host(HostAction::PauseSession { reason }) => {
            let from = suspendable_phase(session, trigger)?;
            require_status_move(session, trigger, SessionStatus::Paused)?;
            Ok(base
                .status(SessionStatus::Paused, Some(*reason))
                .phase(PlayState::Paused, cursor, Some(from)))
        }
        Trigger::Host(HostAction::StartHostSegment) => {
            let from = suspendable_phase(session, trigger)?;
            require_active(session, trigger)?;
            Ok(base.phase(PlayState::HostSegment, cursor, Some(from)))
        }
        Trigger::Host(HostAction::ResumeSession) => {
            let target = resume_target(session, PlayState::Paused)?;
            require_status_move(session, trigger, SessionStatus::Active)?;
            Ok(base
                .status(SessionStatus::Active, None)
                .phase(target, cursor, None))
        }
        Trigger::Host(HostAction::EndHostSegment) => {
            let target = resume_target(session, PlayState::HostSegment)?;
            require_active(session, trigger)?;
            Ok(base.phase(target, cursor, None))
        }
        Trigger::Host(HostAction::EndSession) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::Ended)?;
            Ok(base
                .phase(PlayState::Ended, cursor, None)
                .status(SessionStatus::Ended, None))
        }
        Trigger::Host(HostAction::Begin) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::Countdown)?;
            if session.blocks.is_empty() {
                return Err(illegal(trigger, session));
            }
            Ok(base.phase(PlayState::Countdown, cursor, None))
        }
        Trigger::Timer(TimerKind::Countdown) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::Intro)?;
            Ok(base.phase(PlayState::Intro, cursor, None))
        }
        Trigger::Host(HostAction::StartQuestion) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::QuestionActive)?;
            let block = match session.phase {
                Some(PlayState::Intro) => session.next_block(),
                Some(PlayState::Intermission) => session.current_block(),
                _ => None,
            }
            .ok_or_else(|| illegal(trigger, session))?;
            let block_id = block.id.clone();
            Ok(base
                .phase(PlayState::QuestionActive, Some(block_id.clone()), None)
                .block(&block_id, BlockStatus::Active))
        }
        Trigger::Host(HostAction::LockQuestion) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::QuestionSoftLocked)?;
            Ok(base.phase(PlayState::QuestionSoftLocked, cursor, None))
        }
        Trigger::Host(HostAction::FinalizeLock) | Trigger::Timer(TimerKind::SoftLockGrace) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::QuestionLocked)?;
            let block_id = current_block_id(session, trigger)?;
            Ok(base
                .phase(PlayState::QuestionLocked, cursor, None)
                .block(&block_id, BlockStatus::Locked))
        }
        Trigger::Host(HostAction::ShowResults) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::QuestionResults)?;
            let block_id = current_block_id(session, trigger)?;
            Ok(base
                .phase(PlayState::QuestionResults, cursor, None)
                .block(&block_id, BlockStatus::Completed))
        }
        Trigger::Host(HostAction::ShowLeaderboard) | Trigger::Timer(TimerKind::AutoAdvance) => {
            require_active(session, trigger)?;
            if session.phase != Some(PlayState::QuestionResults) {
                return Err(illegal(trigger, session));
            }
            Ok(base.phase(PlayState::Leaderboard, cursor, None))
        }
        Trigger::Host(HostAction::NextBlock) => {
            require_active(session, trigger)?;
            if session.phase != Some(PlayState::Leaderboard) {
                return Err(illegal(trigger, session));
            }
            match session.next_block() {
                Some(next) => {
                    let next_id = next.id.clone();
                    Ok(base.phase(PlayState::Intermission, Some(next_id), None))
                }
                None => Ok(base.phase(PlayState::FinalResults, cursor, None)),
            }
        }
        Trigger::Host(HostAction::ShowPrizes) => {
            require_active(session, trigger)?;
            if session.phase != Some(PlayState::Leaderboard) {
                return Err(illegal(trigger, session));
            }
            Ok(base.phase(PlayState::Prizes, cursor, None))
        }
        Trigger::Host(HostAction::ClosePrizes) => {
            require_active(session, trigger)?;
            if session.phase != Some(PlayState::Prizes) {
                return Err(illegal(trigger, session));
            }
            Ok(base.phase(PlayState::Leaderboard, cursor, None))
        }
        Trigger::Host(HostAction::SkipBlock) => {
            require_active(session, trigger)?;
            require_edge(session, trigger, PlayState::BlockSkipped)?;
            let block = session
                .current_block()
                .filter(|_| session.phase != Some(PlayState::Intro))
                .or_else(|| session.next_block())
                .ok_or_else(|| illegal(trigger, session))?;
            let block_id = block.id.clone();
            Ok(base
                .phase(PlayState::BlockSkipped, Some(block_id.clone()), None)
                .block(&block_id, BlockStatus::Skipped))
        }
        Trigger::Timer(TimerKind::SkipDisplay) => {
            require_active(session, trigger)?;
            if session.phase != Some(PlayState::BlockSkipped) {
                return Err(illegal(trigger, session));
            }
            match session.next_block() {
                Some(next) => {
                    let next_id = next.id.clone();
                    Ok(base
                        .phase(PlayState::QuestionActive, Some(next_id.clone()), None)
                        .block(&next_id, BlockStatus::Active))
                }
                None => Ok(base.phase(PlayState::FinalResults, cursor, None)),
            }
        }
    }
}

/// Names of the host actions whose plan would succeed right now.
pub fn legal_actions(session: &Session) -> Vec<String> {
    HostAction::catalogue()
        .into_iter()
        .filter(|action| plan(session, &Trigger::Host(action.clone())).is_ok())
        .map(|action| action.name().to_string())
        .collect()
}

fn illegal(trigger: &Trigger, session: &Session) -> TransitionError {
    TransitionError::Illegal {
        trigger: trigger.name(),
        from: phase_label(session.phase),
    }
}

fn require_edge(
    session: &Session,
    trigger: &Trigger,
    to: PlayState,
) -> Result<(), TransitionError> {
    // Linear edges never leave a suspension; only resume does.
    let suspended = session.phase.map(|p| p.is_suspension()).unwrap_or(false);
    if suspended || !PlayState::can_transition(session.phase, to) {
        return Err(illegal(trigger, session));
    }
    Ok(())
}

fn require_active(session: &Session, trigger: &Trigger) -> Result<(), TransitionError> {
    if session.status.accepts_phase_transitions() {
        Ok(())
    } else {
        Err(TransitionError::StatusGate {
            trigger: trigger.name(),
            status: session.status.as_str(),
        })
    }
}

fn require_live(session: &Session, trigger: &Trigger) -> Result<(), TransitionError> {
    if session.status == SessionStatus::Ended {
        return Err(TransitionError::StatusGate {
            trigger: trigger.name(),
            status: session.status.as_str(),
        });
    }
    Ok(())
}

fn require_status_move(
    session: &Session,
    trigger: &Trigger,
    next: SessionStatus,
) -> Result<(), TransitionError> {
    if session.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(TransitionError::StatusGate {
            trigger: trigger.name(),
            status: session.status.as_str(),
        })
    }
}

fn suspendable_phase(session: &Session, trigger: &Trigger) -> Result<PlayState, TransitionError> {
    require_active(session, trigger)?;
    match session.phase {
        Some(phase) if phase.is_suspension() => {
            Err(TransitionError::AlreadySuspended(phase.as_str()))
        }
        Some(phase) if phase.is_suspendable() => Ok(phase),
        _ => Err(illegal(trigger, session)),
    }
}

fn resume_target(session: &Session, suspended_in: PlayState) -> Result<PlayState, TransitionError> {
    if session.phase != Some(suspended_in) {
        return Err(TransitionError::NotSuspended(suspended_in.as_str()));
    }
    Ok(session
        .resume_phase
        .filter(|phase| phase.is_suspendable())
        .unwrap_or(PlayState::Lobby))
}

fn current_block_id(session: &Session, trigger: &Trigger) -> Result<String, TransitionError> {
    session
        .current_block()
        .map(|block| block.id.clone())
        .ok_or_else(|| illegal(trigger, session))
}
