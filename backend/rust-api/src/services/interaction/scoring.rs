use serde::{Deserialize, Serialize};

use crate::models::{Interaction, InteractionPhase};

/// Defaults applied when a block does not override its scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    pub max_score: u32,
    pub penalty_per_attempt: u32,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            max_score: 100,
            penalty_per_attempt: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreModel {
    /// Knowledge checks: full marks minus a penalty per wrong attempt.
    Penalty {
        max_score: u32,
        penalty_per_attempt: u32,
    },
    /// Memorisation and content blocks: the block weight on completion.
    FixedWeight { weight: u32 },
}

impl ScoreModel {
    /// Score for the interaction as it stands. Never increases with more
    /// wrong attempts; revealed knowledge checks score zero.
    pub fn score(&self, interaction: &Interaction) -> u32 {
        match *self {
            ScoreModel::Penalty {
                max_score,
                penalty_per_attempt,
            } => {
                let Some(correct) = interaction.correct_attempt.as_ref() else {
                    return 0;
                };
                if correct.was_revealed {
                    return 0;
                }
                let wrong = interaction.wrong_attempts.len() as u32;
                max_score.saturating_sub(wrong.saturating_mul(penalty_per_attempt))
            }
            ScoreModel::FixedWeight { weight } => {
                let terminal = matches!(
                    interaction.phase,
                    InteractionPhase::Correct
                        | InteractionPhase::Revealed
                        | InteractionPhase::Completed
                );
                if terminal {
                    weight
                } else {
                    0
                }
            }
        }
    }
}
