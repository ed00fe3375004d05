use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;

use super::scoring::{ScoreModel, ScoringPolicy};
use super::InteractionError;
use crate::models::interaction::{AnswerValue, PluginSubState};
use crate::models::{Block, BlockSettings};

lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

const DEFAULT_REQUIRED_LISTEN_RATIO: f64 = 0.9;

/// Closed set of block plugins this service can drive. Anything else is
/// `Unsupported` and every interaction operation on it is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginSpec {
    MultipleChoice {
        option_count: usize,
        correct: usize,
    },
    MultipleAnswer {
        option_count: usize,
        correct: BTreeSet<usize>,
    },
    TrueFalse {
        correct: bool,
    },
    TextInput {
        accepted: Vec<String>,
        case_sensitive: bool,
    },
    Ordering {
        correct_order: Vec<usize>,
    },
    Matching {
        left_count: usize,
        right_count: usize,
        pairs: BTreeSet<(usize, usize)>,
    },
    ImageFocus {
        region_count: usize,
        correct_region: usize,
    },
    Flashcard {
        back: String,
    },
    Media {
        duration_seconds: f64,
        required_ratio: f64,
    },
    RichText,
    Unsupported {
        tag: String,
    },
}

#[derive(Deserialize)]
struct ChoiceContent {
    options: Vec<serde_json::Value>,
    correct: usize,
}

#[derive(Deserialize)]
struct MultiAnswerContent {
    options: Vec<serde_json::Value>,
    correct: BTreeSet<usize>,
}

#[derive(Deserialize)]
struct TrueFalseContent {
    correct: bool,
}

#[derive(Deserialize)]
struct TextInputContent {
    accepted: Vec<String>,
    #[serde(default)]
    case_sensitive: bool,
}

#[derive(Deserialize)]
struct OrderingContent {
    items: Vec<serde_json::Value>,
    #[serde(default)]
    correct_order: Option<Vec<usize>>,
}

#[derive(Deserialize)]
struct MatchingContent {
    left: Vec<serde_json::Value>,
    right: Vec<serde_json::Value>,
    pairs: BTreeSet<(usize, usize)>,
}

#[derive(Deserialize)]
struct ImageFocusContent {
    regions: Vec<serde_json::Value>,
    correct_region: usize,
}

#[derive(Deserialize)]
struct FlashcardContent {
    #[serde(default)]
    back: String,
}

#[derive(Deserialize)]
struct MediaContent {
    duration_seconds: f64,
}

fn parse<T: serde::de::DeserializeOwned>(block: &Block) -> Result<T, InteractionError> {
    serde_json::from_value(block.content.clone()).map_err(|e| {
        InteractionError::InvalidContent(format!("block {} ({}): {}", block.id, block.plugin, e))
    })
}

fn invalid(block: &Block, reason: &str) -> InteractionError {
    InteractionError::InvalidContent(format!("block {} ({}): {}", block.id, block.plugin, reason))
}

impl PluginSpec {
    pub fn from_block(block: &Block) -> Result<Self, InteractionError> {
        let spec = match block.plugin.as_str() {
            "multiple_choice" => {
                let content: ChoiceContent = parse(block)?;
                if content.correct >= content.options.len() {
                    return Err(invalid(block, "correct option out of range"));
                }
                PluginSpec::MultipleChoice {
                    option_count: content.options.len(),
                    correct: content.correct,
                }
            }
            "multiple_answer" => {
                let content: MultiAnswerContent = parse(block)?;
                if content.correct.is_empty()
                    || content.correct.iter().any(|i| *i >= content.options.len())
                {
                    return Err(invalid(block, "correct options empty or out of range"));
                }
                PluginSpec::MultipleAnswer {
                    option_count: content.options.len(),
                    correct: content.correct,
                }
            }
            "true_false" => {
                let content: TrueFalseContent = parse(block)?;
                PluginSpec::TrueFalse {
                    correct: content.correct,
                }
            }
            "text_input" => {
                let content: TextInputContent = parse(block)?;
                if content.accepted.is_empty() {
                    return Err(invalid(block, "no accepted answers"));
                }
                PluginSpec::TextInput {
                    accepted: content.accepted,
                    case_sensitive: content.case_sensitive,
                }
            }
            "ordering" => {
                let content: OrderingContent = parse(block)?;
                let correct_order = content
                    .correct_order
                    .unwrap_or_else(|| (0..content.items.len()).collect());
                if !is_permutation(&correct_order, content.items.len()) {
                    return Err(invalid(block, "correct order is not a permutation of items"));
                }
                PluginSpec::Ordering { correct_order }
            }
            "matching" => {
                let content: MatchingContent = parse(block)?;
                let in_range = content
                    .pairs
                    .iter()
                    .all(|(l, r)| *l < content.left.len() && *r < content.right.len());
                if content.pairs.is_empty() || !in_range {
                    return Err(invalid(block, "pairs empty or out of range"));
                }
                PluginSpec::Matching {
                    left_count: content.left.len(),
                    right_count: content.right.len(),
                    pairs: content.pairs,
                }
            }
            "image_focus" => {
                let content: ImageFocusContent = parse(block)?;
                if content.correct_region >= content.regions.len() {
                    return Err(invalid(block, "correct region out of range"));
                }
                PluginSpec::ImageFocus {
                    region_count: content.regions.len(),
                    correct_region: content.correct_region,
                }
            }
            "flashcard" => {
                let content: FlashcardContent = parse(block)?;
                PluginSpec::Flashcard { back: content.back }
            }
            "media" | "video" | "audio" => {
                let content: MediaContent = parse(block)?;
                if content.duration_seconds <= 0.0 {
                    return Err(invalid(block, "duration must be positive"));
                }
                PluginSpec::Media {
                    duration_seconds: content.duration_seconds,
                    required_ratio: required_listen_ratio(&block.settings),
                }
            }
            "rich_text" => PluginSpec::RichText,
            other => PluginSpec::Unsupported {
                tag: other.to_string(),
            },
        };
        Ok(spec)
    }

    pub fn name(&self) -> &str {
        match self {
            PluginSpec::MultipleChoice { .. } => "multiple_choice",
            PluginSpec::MultipleAnswer { .. } => "multiple_answer",
            PluginSpec::TrueFalse { .. } => "true_false",
            PluginSpec::TextInput { .. } => "text_input",
            PluginSpec::Ordering { .. } => "ordering",
            PluginSpec::Matching { .. } => "matching",
            PluginSpec::ImageFocus { .. } => "image_focus",
            PluginSpec::Flashcard { .. } => "flashcard",
            PluginSpec::Media { .. } => "media",
            PluginSpec::RichText => "rich_text",
            PluginSpec::Unsupported { tag } => tag,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, PluginSpec::Unsupported { .. })
    }

    /// Whether the plugin takes answers through select/check.
    pub fn is_answerable(&self) -> bool {
        matches!(
            self,
            PluginSpec::MultipleChoice { .. }
                | PluginSpec::MultipleAnswer { .. }
                | PluginSpec::TrueFalse { .. }
                | PluginSpec::TextInput { .. }
                | PluginSpec::Ordering { .. }
                | PluginSpec::Matching { .. }
                | PluginSpec::ImageFocus { .. }
        )
    }

    /// Memorisation blocks may be revealed without an attempt.
    pub fn allows_direct_reveal(&self) -> bool {
        matches!(self, PluginSpec::Flashcard { .. })
    }

    pub fn score_model(&self, settings: &BlockSettings, policy: &ScoringPolicy) -> ScoreModel {
        match self {
            PluginSpec::Flashcard { .. } | PluginSpec::Media { .. } | PluginSpec::RichText => {
                ScoreModel::FixedWeight {
                    weight: settings.weight,
                }
            }
            _ => ScoreModel::Penalty {
                max_score: settings.max_score.unwrap_or(policy.max_score),
                penalty_per_attempt: settings
                    .penalty_per_attempt
                    .unwrap_or(policy.penalty_per_attempt),
            },
        }
    }

    /// Number of presented items that may be shuffled.
    pub fn shuffle_len(&self) -> Option<usize> {
        match self {
            PluginSpec::MultipleChoice { option_count, .. }
            | PluginSpec::MultipleAnswer { option_count, .. } => Some(*option_count),
            PluginSpec::Ordering { correct_order } => Some(correct_order.len()),
            PluginSpec::Matching { left_count, .. } => Some(*left_count),
            _ => None,
        }
    }

    pub fn initial_sub_state(&self) -> PluginSubState {
        match self {
            PluginSpec::MultipleAnswer { .. } => PluginSubState::PartialCredit {
                locked: BTreeSet::new(),
            },
            PluginSpec::Matching { .. } => PluginSubState::Matching {
                matched_pairs: BTreeSet::new(),
            },
            PluginSpec::Media { .. } => PluginSubState::Media {
                listened_seconds: 0.0,
            },
            PluginSpec::ImageFocus { .. } => PluginSubState::ImageFocus { focused_region: 0 },
            PluginSpec::RichText => PluginSubState::RichText { viewed: false },
            _ => PluginSubState::None,
        }
    }

    /// Checks the value has the right shape and stays within bounds.
    pub fn validate_value(&self, value: &AnswerValue) -> Result<(), InteractionError> {
        let ok = match (self, value) {
            (PluginSpec::MultipleChoice { option_count, .. }, AnswerValue::Choice(i)) => {
                i < option_count
            }
            (PluginSpec::MultipleAnswer { option_count, .. }, AnswerValue::Choices(set)) => {
                !set.is_empty() && set.iter().all(|i| i < option_count)
            }
            (PluginSpec::TrueFalse { .. }, AnswerValue::Bool(_)) => true,
            (PluginSpec::TextInput { .. }, AnswerValue::Text(text)) => {
                !text.trim().is_empty() && text.len() <= 1000
            }
            (PluginSpec::Ordering { correct_order }, AnswerValue::Sequence(seq)) => {
                is_permutation(seq, correct_order.len())
            }
            (
                PluginSpec::Matching {
                    left_count,
                    right_count,
                    ..
                },
                AnswerValue::Pairs(pairs),
            ) => !pairs.is_empty() && pairs.iter().all(|(l, r)| l < left_count && r < right_count),
            (PluginSpec::ImageFocus { region_count, .. }, AnswerValue::Region(i)) => {
                i < region_count
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(InteractionError::InvalidPayload(format!(
                "{} value is not valid for {}",
                value.kind(),
                self.name()
            )))
        }
    }

    pub fn is_correct(&self, value: &AnswerValue) -> bool {
        match (self, value) {
            (PluginSpec::MultipleChoice { correct, .. }, AnswerValue::Choice(i)) => i == correct,
            (PluginSpec::MultipleAnswer { correct, .. }, AnswerValue::Choices(set)) => {
                set == correct
            }
            (PluginSpec::TrueFalse { correct }, AnswerValue::Bool(b)) => b == correct,
            (
                PluginSpec::TextInput {
                    accepted,
                    case_sensitive,
                },
                AnswerValue::Text(text),
            ) => {
                let given = normalize_text(text, *case_sensitive);
                accepted
                    .iter()
                    .any(|candidate| normalize_text(candidate, *case_sensitive) == given)
            }
            (PluginSpec::Ordering { correct_order }, AnswerValue::Sequence(seq)) => {
                seq == correct_order
            }
            (PluginSpec::Matching { pairs, .. }, AnswerValue::Pairs(given)) => given == pairs,
            (PluginSpec::ImageFocus { correct_region, .. }, AnswerValue::Region(i)) => {
                i == correct_region
            }
            _ => false,
        }
    }

    /// Value recorded when the answer is revealed.
    pub fn correct_value(&self) -> Option<AnswerValue> {
        match self {
            PluginSpec::MultipleChoice { correct, .. } => Some(AnswerValue::Choice(*correct)),
            PluginSpec::MultipleAnswer { correct, .. } => {
                Some(AnswerValue::Choices(correct.clone()))
            }
            PluginSpec::TrueFalse { correct } => Some(AnswerValue::Bool(*correct)),
            PluginSpec::TextInput { accepted, .. } => {
                accepted.first().cloned().map(AnswerValue::Text)
            }
            PluginSpec::Ordering { correct_order } => {
                Some(AnswerValue::Sequence(correct_order.clone()))
            }
            PluginSpec::Matching { pairs, .. } => Some(AnswerValue::Pairs(pairs.clone())),
            PluginSpec::ImageFocus { correct_region, .. } => {
                Some(AnswerValue::Region(*correct_region))
            }
            PluginSpec::Flashcard { back } => Some(AnswerValue::Text(back.clone())),
            _ => None,
        }
    }

    pub fn region_count(&self) -> Option<usize> {
        match self {
            PluginSpec::ImageFocus { region_count, .. } => Some(*region_count),
            _ => None,
        }
    }
}

fn required_listen_ratio(settings: &BlockSettings) -> f64 {
    settings
        .extra
        .get("required_ratio")
        .and_then(|value| value.as_f64())
        .filter(|ratio| *ratio > 0.0 && *ratio <= 1.0)
        .unwrap_or(DEFAULT_REQUIRED_LISTEN_RATIO)
}

fn is_permutation(seq: &[usize], len: usize) -> bool {
    if seq.len() != len {
        return false;
    }
    let unique: BTreeSet<usize> = seq.iter().copied().collect();
    unique.len() == len && unique.iter().all(|i| *i < len)
}

pub fn normalize_text(text: &str, case_sensitive: bool) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(text.trim(), " ").into_owned();
    if case_sensitive {
        collapsed
    } else {
        collapsed.to_lowercase()
    }
}
