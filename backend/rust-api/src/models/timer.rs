use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::play_state::PlayState;
use super::view::SessionView;

/// Timers the play machine arms on entering a phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// 3-2-1 then "go", ends in `intro`.
    Countdown,
    /// Grace period of `question_soft_locked`, ends in `question_locked`.
    SoftLockGrace,
    /// Display window of `block_skipped`.
    SkipDisplay,
    /// Per-block auto-continue out of `question_results`.
    AutoAdvance,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Countdown => "countdown",
            TimerKind::SoftLockGrace => "soft_lock_grace",
            TimerKind::SkipDisplay => "skip_display",
            TimerKind::AutoAdvance => "auto_advance",
        }
    }
}

/// Events pushed to host consoles over SSE.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LiveEvent {
    SessionView(Box<SessionView>),
    CountdownTick(CountdownTick),
    TimerFired(TimerFired),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CountdownTick {
    pub session_id: String,
    /// 3, 2, 1, then 0 for "go".
    pub remaining: u8,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimerFired {
    pub session_id: String,
    pub timer: TimerKind,
    pub armed_for: PlayState,
    pub timestamp: DateTime<Utc>,
}

impl LiveEvent {
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            LiveEvent::SessionView(_) => "session-view",
            LiveEvent::CountdownTick(_) => "countdown-tick",
            LiveEvent::TimerFired(_) => "timer-fired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_tick_event_shape() {
        let event = LiveEvent::CountdownTick(CountdownTick {
            session_id: "s-1".to_string(),
            remaining: 2,
            timestamp: Utc::now(),
        });
        assert_eq!(event.event_name(), "countdown-tick");
        let json: serde_json::Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert_eq!(json["type"], "countdown-tick");
        assert_eq!(json["remaining"], 2);
    }
}
