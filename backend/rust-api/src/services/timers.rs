use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::PlayTimings;
use crate::models::timer::TimerKind;
use crate::models::{PlayState, Session, SessionStatus};

/// Signals a phase timer sends back to its owning orchestrator. `epoch`
/// identifies the arming; signals from an older epoch are stale.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerSignal {
    Tick {
        remaining: u8,
        epoch: u64,
    },
    Fired {
        kind: TimerKind,
        armed_for: PlayState,
        epoch: u64,
    },
}

impl TimerSignal {
    pub fn epoch(&self) -> u64 {
        match self {
            TimerSignal::Tick { epoch, .. } | TimerSignal::Fired { epoch, .. } => *epoch,
        }
    }
}

/// Timer the given session state calls for, if any. Timers only run while
/// the session is active.
pub fn timer_for(session: &Session) -> Option<TimerKind> {
    if session.status != SessionStatus::Active {
        return None;
    }
    match session.phase? {
        PlayState::Countdown => Some(TimerKind::Countdown),
        PlayState::QuestionSoftLocked => Some(TimerKind::SoftLockGrace),
        PlayState::BlockSkipped => Some(TimerKind::SkipDisplay),
        PlayState::QuestionResults => session
            .current_block()
            .filter(|block| block.settings.auto_advance)
            .map(|_| TimerKind::AutoAdvance),
        _ => None,
    }
}

pub fn duration_for(kind: TimerKind, session: &Session, timings: &PlayTimings) -> Duration {
    let ms = match kind {
        TimerKind::Countdown => {
            timings.countdown_step_ms * u64::from(timings.countdown_steps) + timings.countdown_go_ms
        }
        TimerKind::SoftLockGrace => timings.soft_lock_grace_ms,
        TimerKind::SkipDisplay => timings.skip_display_ms,
        TimerKind::AutoAdvance => session
            .current_block()
            .and_then(|block| block.settings.auto_advance_delay_ms)
            .unwrap_or(timings.auto_advance_default_ms),
    };
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ArmedKey {
    kind: TimerKind,
    phase: PlayState,
    block_id: Option<String>,
}

/// The single phase timer of one session.
pub struct PhaseTimers {
    timings: PlayTimings,
    signals: mpsc::UnboundedSender<TimerSignal>,
    epoch: u64,
    armed: Option<ArmedKey>,
    handle: Option<JoinHandle<()>>,
}

impl PhaseTimers {
    pub fn new(timings: PlayTimings, signals: mpsc::UnboundedSender<TimerSignal>) -> Self {
        Self {
            timings,
            signals,
            epoch: 0,
            armed: None,
            handle: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn armed(&self) -> Option<TimerKind> {
        self.armed.as_ref().map(|key| key.kind)
    }

    /// Arms the timer the effective session calls for. A timer already
    /// running for the same phase and block is left alone; anything else is
    /// cancelled first.
    pub fn sync(&mut self, session: &Session) {
        let wanted = timer_for(session).and_then(|kind| {
            session.phase.map(|phase| ArmedKey {
                kind,
                phase,
                block_id: session.current_block_id.clone(),
            })
        });

        if wanted == self.armed {
            return;
        }

        self.cancel();
        let Some(key) = wanted else {
            return;
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let delay = duration_for(key.kind, session, &self.timings);
        let signals = self.signals.clone();
        tracing::debug!(
            "Arming {} timer for session {} in {} ({:?})",
            key.kind.as_str(),
            session.id,
            key.phase,
            delay
        );

        let handle = match key.kind {
            TimerKind::Countdown => {
                let timings = self.timings.clone();
                tokio::spawn(run_countdown(timings, key.phase, epoch, signals))
            }
            kind => {
                let phase = key.phase;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = signals.send(TimerSignal::Fired {
                        kind,
                        armed_for: phase,
                        epoch,
                    });
                })
            }
        };

        self.armed = Some(key);
        self.handle = Some(handle);
    }

    pub fn is_current(&self, signal: &TimerSignal) -> bool {
        self.armed.is_some() && signal.epoch() == self.epoch
    }

    /// Marks the armed timer as spent once its firing has been handled.
    pub fn consume(&mut self) {
        self.armed = None;
        self.handle = None;
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        if self.armed.take().is_some() {
            self.epoch += 1;
        }
    }
}

impl Drop for PhaseTimers {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_countdown(
    timings: PlayTimings,
    armed_for: PlayState,
    epoch: u64,
    signals: mpsc::UnboundedSender<TimerSignal>,
) {
    let step = Duration::from_millis(timings.countdown_step_ms);
    for remaining in (1..=timings.countdown_steps).rev() {
        if signals.send(TimerSignal::Tick { remaining, epoch }).is_err() {
            return;
        }
        tokio::time::sleep(step).await;
    }
    if signals
        .send(TimerSignal::Tick {
            remaining: 0,
            epoch,
        })
        .is_err()
    {
        return;
    }
    tokio::time::sleep(Duration::from_millis(timings.countdown_go_ms)).await;
    let _ = signals.send(TimerSignal::Fired {
        kind: TimerKind::Countdown,
        armed_for,
        epoch,
    });
}
