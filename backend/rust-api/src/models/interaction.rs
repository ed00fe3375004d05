use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::{Validate, ValidationError};

/// Committed answer value. Only the committed value crosses into the
/// interaction machine; per-keystroke UI state never does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
    Choice(usize),
    Choices(BTreeSet<usize>),
    Text(String),
    Bool(bool),
    Sequence(Vec<usize>),
    Pairs(BTreeSet<(usize, usize)>),
    Region(usize),
}

impl AnswerValue {
    pub fn kind(&self) -> &'static str {
        match self {
            AnswerValue::Choice(_) => "choice",
            AnswerValue::Choices(_) => "choices",
            AnswerValue::Text(_) => "text",
            AnswerValue::Bool(_) => "bool",
            AnswerValue::Sequence(_) => "sequence",
            AnswerValue::Pairs(_) => "pairs",
            AnswerValue::Region(_) => "region",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InteractionPhase {
    #[default]
    Unanswered,
    Checking,
    Correct,
    Incorrect,
    Revealed,
    Completed,
}

impl InteractionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionPhase::Unanswered => "unanswered",
            InteractionPhase::Checking => "checking",
            InteractionPhase::Correct => "correct",
            InteractionPhase::Incorrect => "incorrect",
            InteractionPhase::Revealed => "revealed",
            InteractionPhase::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub value: AnswerValue,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectAttempt {
    pub value: AnswerValue,
    pub timestamp: DateTime<Utc>,
    pub was_revealed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginSubState {
    #[default]
    None,
    /// Correct choices found in earlier attempts; they stay selected.
    PartialCredit { locked: BTreeSet<usize> },
    Media { listened_seconds: f64 },
    Matching { matched_pairs: BTreeSet<(usize, usize)> },
    ImageFocus { focused_region: usize },
    RichText { viewed: bool },
}

/// Where an interaction lives: a live session or a self-paced lesson.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    #[default]
    Play,
    /// Ephemeral; never persisted.
    Preview,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InteractionKey {
    pub scope_id: String,
    pub block_id: String,
    pub participant_id: String,
}

impl InteractionKey {
    pub fn new(scope_id: &str, block_id: &str, participant_id: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            block_id: block_id.to_string(),
            participant_id: participant_id.to_string(),
        }
    }

    pub fn document_id(&self) -> String {
        format!("{}:{}:{}", self.scope_id, self.block_id, self.participant_id)
    }
}

/// One participant's progress on one block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    #[serde(rename = "_id")]
    pub id: String,
    pub scope_id: String,
    pub block_id: String,
    pub participant_id: String,
    pub plugin: String,
    pub phase: InteractionPhase,
    pub attempts_count: u32,
    #[serde(default)]
    pub wrong_attempts: Vec<AttemptRecord>,
    #[serde(default)]
    pub correct_attempt: Option<CorrectAttempt>,
    #[serde(default)]
    pub pending_selection: Option<AnswerValue>,
    pub score: u32,
    #[serde(default)]
    pub sub_state: PluginSubState,
    /// Shuffled presentation, generated once and kept for the session view.
    #[serde(default)]
    pub presentation_order: Option<Vec<usize>>,
    pub updated_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(key: &InteractionKey, plugin: &str) -> Self {
        Self {
            id: key.document_id(),
            scope_id: key.scope_id.clone(),
            block_id: key.block_id.clone(),
            participant_id: key.participant_id.clone(),
            plugin: plugin.to_string(),
            phase: InteractionPhase::Unanswered,
            attempts_count: 0,
            wrong_attempts: Vec::new(),
            correct_attempt: None,
            pending_selection: None,
            score: 0,
            sub_state: PluginSubState::None,
            presentation_order: None,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> InteractionKey {
        InteractionKey::new(&self.scope_id, &self.block_id, &self.participant_id)
    }

    pub fn can_interact(&self) -> bool {
        self.correct_attempt.is_none()
            && matches!(
                self.phase,
                InteractionPhase::Unanswered | InteractionPhase::Checking | InteractionPhase::Incorrect
            )
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self.phase,
            InteractionPhase::Correct | InteractionPhase::Revealed | InteractionPhase::Completed
        )
    }

    pub fn was_revealed(&self) -> bool {
        self.correct_attempt
            .as_ref()
            .map(|attempt| attempt.was_revealed)
            .unwrap_or(false)
    }
}

/// Operation requested against one participant's interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InteractionOp {
    Select { value: AnswerValue },
    CheckAnswer,
    TryAgain,
    RevealCorrectAnswer,
    Complete,
    Reset,
    RecordListening { seconds: f64 },
    MarkViewed,
    FocusRegion { index: usize },
    NextRegion,
    PreviousRegion,
}

/// Completion signal reported upward to session progression.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[validate(schema(function = "validate_report_consistency"))]
pub struct InteractionReport {
    #[validate(length(min = 1, max = 128))]
    pub block_id: String,
    #[validate(length(min = 1, max = 128))]
    pub participant_id: String,
    pub is_complete: bool,
    #[validate(range(max = 100000))]
    pub score: u32,
    pub attempts: u32,
    pub snapshot: Interaction,
}

impl InteractionReport {
    pub fn from_interaction(interaction: &Interaction) -> Self {
        Self {
            block_id: interaction.block_id.clone(),
            participant_id: interaction.participant_id.clone(),
            is_complete: interaction.is_completed(),
            score: interaction.score,
            attempts: interaction.attempts_count,
            snapshot: interaction.clone(),
        }
    }
}

fn validate_report_consistency(report: &InteractionReport) -> Result<(), ValidationError> {
    let snapshot = &report.snapshot;
    if snapshot.block_id != report.block_id || snapshot.participant_id != report.participant_id {
        return Err(ValidationError::new("snapshot_key_mismatch"));
    }
    if snapshot.attempts_count != report.attempts || snapshot.score != report.score {
        return Err(ValidationError::new("snapshot_counters_mismatch"));
    }
    if snapshot.wrong_attempts.len() as u32 > snapshot.attempts_count {
        return Err(ValidationError::new("wrong_attempts_exceed_attempts"));
    }
    if report.is_complete != snapshot.is_completed() {
        return Err(ValidationError::new("completion_flag_mismatch"));
    }
    let needs_correct_attempt = matches!(
        snapshot.phase,
        InteractionPhase::Correct | InteractionPhase::Revealed
    );
    if needs_correct_attempt && snapshot.correct_attempt.is_none() {
        return Err(ValidationError::new("missing_correct_attempt"));
    }
    Ok(())
}
