use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Phase of a live session as paced by the host.
///
/// "Not started" is represented by `Option<PlayState>::None` on the session row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlayState {
    Lobby,
    Countdown,
    Intro,
    QuestionActive,
    QuestionSoftLocked,
    QuestionLocked,
    QuestionResults,
    Leaderboard,
    Intermission,
    FinalResults,
    Ended,
    Paused,
    HostSegment,
    BlockSkipped,
    Prizes,
}

impl PlayState {
    pub const ALL: [PlayState; 15] = [
        PlayState::Lobby,
        PlayState::Countdown,
        PlayState::Intro,
        PlayState::QuestionActive,
        PlayState::QuestionSoftLocked,
        PlayState::QuestionLocked,
        PlayState::QuestionResults,
        PlayState::Leaderboard,
        PlayState::Intermission,
        PlayState::FinalResults,
        PlayState::Ended,
        PlayState::Paused,
        PlayState::HostSegment,
        PlayState::BlockSkipped,
        PlayState::Prizes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayState::Lobby => "lobby",
            PlayState::Countdown => "countdown",
            PlayState::Intro => "intro",
            PlayState::QuestionActive => "question_active",
            PlayState::QuestionSoftLocked => "question_soft_locked",
            PlayState::QuestionLocked => "question_locked",
            PlayState::QuestionResults => "question_results",
            PlayState::Leaderboard => "leaderboard",
            PlayState::Intermission => "intermission",
            PlayState::FinalResults => "final_results",
            PlayState::Ended => "ended",
            PlayState::Paused => "paused",
            PlayState::HostSegment => "host_segment",
            PlayState::BlockSkipped => "block_skipped",
            PlayState::Prizes => "prizes",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlayState::Ended)
    }

    /// `paused` and `host_segment` hold the single resume slot.
    pub fn is_suspension(&self) -> bool {
        matches!(self, PlayState::Paused | PlayState::HostSegment)
    }

    /// States from which the host may suspend into `paused`/`host_segment`.
    pub fn is_suspendable(&self) -> bool {
        !self.is_terminal() && !self.is_suspension()
    }

    /// States from which the current block may be skipped.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            PlayState::Intro
                | PlayState::QuestionActive
                | PlayState::QuestionSoftLocked
                | PlayState::QuestionLocked
                | PlayState::QuestionResults
                | PlayState::Intermission
        )
    }

    /// Documented phase graph. Context-dependent guards (next block exists,
    /// exact resume target, status gate) live in the play machine.
    pub fn can_transition(from: Option<PlayState>, to: PlayState) -> bool {
        let Some(from) = from else {
            return to == PlayState::Lobby;
        };

        if to.is_suspension() {
            return from.is_suspendable();
        }
        if from.is_suspension() {
            return to.is_suspendable();
        }
        if to == PlayState::BlockSkipped {
            return from.is_skippable();
        }

        matches!(
            (from, to),
            (PlayState::Lobby, PlayState::Countdown)
                | (PlayState::Countdown, PlayState::Intro)
                | (PlayState::Intro, PlayState::QuestionActive)
                | (PlayState::QuestionActive, PlayState::QuestionSoftLocked)
                | (PlayState::QuestionSoftLocked, PlayState::QuestionLocked)
                | (PlayState::QuestionLocked, PlayState::QuestionResults)
                | (PlayState::QuestionResults, PlayState::Leaderboard)
                | (PlayState::Leaderboard, PlayState::Intermission)
                | (PlayState::Leaderboard, PlayState::FinalResults)
                | (PlayState::Leaderboard, PlayState::Prizes)
                | (PlayState::Prizes, PlayState::Leaderboard)
                | (PlayState::Intermission, PlayState::QuestionActive)
                | (PlayState::BlockSkipped, PlayState::QuestionActive)
                | (PlayState::BlockSkipped, PlayState::FinalResults)
                | (PlayState::FinalResults, PlayState::Ended)
        )
    }
}

impl fmt::Display for PlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlayState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        PlayState::ALL
            .into_iter()
            .find(|state| state.as_str() == value)
            .ok_or_else(|| format!("Invalid play state: {}", value))
    }
}

/// Label used in metrics and logs for an optional phase.
pub fn phase_label(phase: Option<PlayState>) -> &'static str {
    phase.map(|p| p.as_str()).unwrap_or("none")
}

#[cfg(test)]
mod tests {
    use super::PlayState;

    fn documented_edges() -> Vec<(Option<PlayState>, PlayState)> {
        use PlayState as S;
        let mut edges = vec![
            (None, S::Lobby),
            (Some(S::Lobby), S::Countdown),
            (Some(S::Countdown), S::Intro),
            (Some(S::Intro), S::QuestionActive),
            (Some(S::QuestionActive), S::QuestionSoftLocked),
            (Some(S::QuestionSoftLocked), S::QuestionLocked),
            (Some(S::QuestionLocked), S::QuestionResults),
            (Some(S::QuestionResults), S::Leaderboard),
            (Some(S::Leaderboard), S::Intermission),
            (Some(S::Leaderboard), S::FinalResults),
            (Some(S::Leaderboard), S::Prizes),
            (Some(S::Prizes), S::Leaderboard),
            (Some(S::Intermission), S::QuestionActive),
            (Some(S::BlockSkipped), S::QuestionActive),
            (Some(S::BlockSkipped), S::FinalResults),
            (Some(S::FinalResults), S::Ended),
        ];
        for from in [
            S::Intro,
            S::QuestionActive,
            S::QuestionSoftLocked,
            S::QuestionLocked,
            S::QuestionResults,
            S::Intermission,
        ] {
            edges.push((Some(from), S::BlockSkipped));
        }
        for state in PlayState::ALL {
            if state != S::Ended && state != S::Paused && state != S::HostSegment {
                edges.push((Some(state), S::Paused));
                edges.push((Some(state), S::HostSegment));
                edges.push((Some(S::Paused), state));
                edges.push((Some(S::HostSegment), state));
            }
        }
        edges
    }

    #[test]
    fn can_transition_matches_documented_graph_for_all_pairs() {
        let edges = documented_edges();
        let sources = std::iter::once(None).chain(PlayState::ALL.into_iter().map(Some));
        for from in sources {
            for to in PlayState::ALL {
                let expected = edges.contains(&(from, to));
                assert_eq!(
                    PlayState::can_transition(from, to),
                    expected,
                    "edge {:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn ended_is_a_dead_end() {
        for to in PlayState::ALL {
            assert!(!PlayState::can_transition(Some(PlayState::Ended), to));
        }
    }

    #[test]
    fn play_state_round_trips_through_str() {
        for state in PlayState::ALL {
            assert_eq!(state.as_str().parse::<PlayState>(), Ok(state));
        }
        assert!("warmup".parse::<PlayState>().is_err());
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&PlayState::QuestionSoftLocked).unwrap();
        assert_eq!(json, "\"question_soft_locked\"");
    }
}
