use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;

use super::plugins::PluginSpec;
use super::scoring::{ScoreModel, ScoringPolicy};
use super::InteractionError;
use crate::metrics::ANSWER_CHECKS_TOTAL;
use crate::models::interaction::{AttemptRecord, CorrectAttempt, PluginSubState};
use crate::models::{
    AnswerValue, Block, Interaction, InteractionKey, InteractionMode, InteractionPhase,
    InteractionReport,
};

/// Per-participant state machine for one block.
///
/// ```text
/// unanswered --check--> checking --> correct --complete--> completed
///                           |
///                           +--> incorrect --try_again--> unanswered
///                                    |
///                                    +--reveal--> revealed --complete--> completed
/// ```
///
/// Every mutating operation returns the report the caller forwards to
/// session progression.
#[derive(Debug, Clone)]
pub struct InteractionMachine {
    spec: PluginSpec,
    model: ScoreModel,
    interaction: Interaction,
}

impl InteractionMachine {
    pub fn new(
        key: &InteractionKey,
        block: &Block,
        policy: &ScoringPolicy,
    ) -> Result<Self, InteractionError> {
        let interaction = Interaction::new(key, &block.plugin);
        Self::restore(interaction, block, policy)
    }

    /// Rebuilds the machine around a stored interaction. Missing plugin
    /// sub-state and presentation order are filled in; existing ones kept.
    pub fn restore(
        mut interaction: Interaction,
        block: &Block,
        policy: &ScoringPolicy,
    ) -> Result<Self, InteractionError> {
        let spec = PluginSpec::from_block(block)?;
        let model = spec.score_model(&block.settings, policy);

        if interaction.sub_state == PluginSubState::None {
            interaction.sub_state = spec.initial_sub_state();
        }
        if interaction.presentation_order.is_none() && block.settings.shuffle {
            interaction.presentation_order = spec.shuffle_len().map(shuffled_indices);
        }

        Ok(Self {
            spec,
            model,
            interaction,
        })
    }

    pub fn interaction(&self) -> &Interaction {
        &self.interaction
    }

    pub fn into_interaction(self) -> Interaction {
        self.interaction
    }

    pub fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    pub fn report(&self) -> InteractionReport {
        InteractionReport::from_interaction(&self.interaction)
    }

    pub fn select(&mut self, value: AnswerValue) -> Result<InteractionReport, InteractionError> {
        self.ensure_answerable("select")?;
        self.ensure_phase("select", &[InteractionPhase::Unanswered])?;

        let value = self.with_locked_parts(value);
        self.spec.validate_value(&value)?;
        self.interaction.pending_selection = Some(value);
        Ok(self.touch())
    }

    /// First half of a check: moves to `checking` and hands back the value
    /// being evaluated.
    pub fn begin_check(&mut self) -> Result<AnswerValue, InteractionError> {
        self.ensure_answerable("check_answer")?;
        self.ensure_phase("check_answer", &[InteractionPhase::Unanswered])?;

        let value = self
            .interaction
            .pending_selection
            .clone()
            .ok_or(InteractionError::NoSelection)?;
        self.interaction.phase = InteractionPhase::Checking;
        Ok(value)
    }

    pub fn resolve_check(&mut self) -> Result<InteractionReport, InteractionError> {
        self.ensure_supported()?;
        self.ensure_phase("resolve_check", &[InteractionPhase::Checking])?;

        let value = self
            .interaction
            .pending_selection
            .clone()
            .ok_or(InteractionError::NoSelection)?;
        let correct = self.spec.is_correct(&value);
        let now = Utc::now();

        self.interaction.attempts_count += 1;
        if correct {
            self.interaction.phase = InteractionPhase::Correct;
            self.interaction.correct_attempt = Some(CorrectAttempt {
                value,
                timestamp: now,
                was_revealed: false,
            });
        } else {
            self.lock_partial_credit(&value);
            self.interaction.phase = InteractionPhase::Incorrect;
            self.interaction.wrong_attempts.push(AttemptRecord {
                value,
                timestamp: now,
            });
        }

        ANSWER_CHECKS_TOTAL
            .with_label_values(&[self.spec.name(), if correct { "true" } else { "false" }])
            .inc();

        self.rescore();
        Ok(self.touch())
    }

    pub fn check_answer(&mut self) -> Result<InteractionReport, InteractionError> {
        self.begin_check()?;
        self.resolve_check()
    }

    /// Back to `unanswered` after a wrong answer. Partial credit stays
    /// selected.
    pub fn try_again(&mut self) -> Result<InteractionReport, InteractionError> {
        self.ensure_answerable("try_again")?;
        self.ensure_phase("try_again", &[InteractionPhase::Incorrect])?;

        self.interaction.phase = InteractionPhase::Unanswered;
        self.interaction.pending_selection = match &self.interaction.sub_state {
            PluginSubState::PartialCredit { locked } if !locked.is_empty() => {
                Some(AnswerValue::Choices(locked.clone()))
            }
            PluginSubState::Matching { matched_pairs } if !matched_pairs.is_empty() => {
                Some(AnswerValue::Pairs(matched_pairs.clone()))
            }
            _ => None,
        };
        Ok(self.touch())
    }

    pub fn reveal_correct_answer(&mut self) -> Result<InteractionReport, InteractionError> {
        self.ensure_supported()?;
        let allowed: &[InteractionPhase] = if self.spec.allows_direct_reveal() {
            &[InteractionPhase::Unanswered, InteractionPhase::Incorrect]
        } else {
            &[InteractionPhase::Incorrect]
        };
        self.ensure_phase("reveal_correct_answer", allowed)?;

        let value = self.spec.correct_value().ok_or_else(|| {
            InteractionError::NotApplicable {
                operation: "reveal_correct_answer",
                plugin: self.spec.name().to_string(),
            }
        })?;

        self.interaction.phase = InteractionPhase::Revealed;
        self.interaction.pending_selection = None;
        self.interaction.correct_attempt = Some(CorrectAttempt {
            value,
            timestamp: Utc::now(),
            was_revealed: true,
        });
        self.rescore();
        Ok(self.touch())
    }

    pub fn complete(&mut self) -> Result<InteractionReport, InteractionError> {
        self.ensure_supported()?;
        self.ensure_phase(
            "complete",
            &[InteractionPhase::Correct, InteractionPhase::Revealed],
        )?;

        self.interaction.phase = InteractionPhase::Completed;
        self.rescore();
        Ok(self.touch())
    }

    /// Clears all progress. The presentation order survives so a reset
    /// participant sees the same layout. In play mode a correct, revealed or
    /// completed interaction is final and cannot be reopened.
    pub fn reset(&mut self, mode: InteractionMode) -> Result<InteractionReport, InteractionError> {
        self.ensure_supported()?;
        if mode == InteractionMode::Play && self.interaction.is_completed() {
            return Err(self.invalid_phase("reset"));
        }

        let order = self.interaction.presentation_order.take();
        let mut fresh = Interaction::new(&self.interaction.key(), &self.interaction.plugin);
        fresh.sub_state = self.spec.initial_sub_state();
        fresh.presentation_order = order;
        self.interaction = fresh;
        Ok(self.report())
    }

    /// Media only: accumulates listened time and completes once the
    /// required share of the duration has been reached.
    pub fn record_listening(&mut self, seconds: f64) -> Result<InteractionReport, InteractionError> {
        self.ensure_supported()?;
        let PluginSpec::Media {
            duration_seconds,
            required_ratio,
        } = self.spec
        else {
            return Err(self.not_applicable("record_listening"));
        };
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(InteractionError::InvalidPayload(
                "listened seconds must be a non-negative number".to_string(),
            ));
        }
        self.ensure_phase("record_listening", &[InteractionPhase::Unanswered])?;

        let listened = match &mut self.interaction.sub_state {
            PluginSubState::Media { listened_seconds } => {
                *listened_seconds = (*listened_seconds + seconds).min(duration_seconds);
                *listened_seconds
            }
            other => {
                *other = PluginSubState::Media {
                    listened_seconds: seconds.min(duration_seconds),
                };
                seconds.min(duration_seconds)
            }
        };

        if listened >= duration_seconds * required_ratio {
            self.interaction.phase = InteractionPhase::Completed;
            self.rescore();
        }
        Ok(self.touch())
    }

    pub fn mark_viewed(&mut self) -> Result<InteractionReport, InteractionError> {
        self.ensure_supported()?;
        if self.spec != PluginSpec::RichText {
            return Err(self.not_applicable("mark_viewed"));
        }
        self.ensure_phase("mark_viewed", &[InteractionPhase::Unanswered])?;

        self.interaction.sub_state = PluginSubState::RichText { viewed: true };
        self.interaction.phase = InteractionPhase::Completed;
        self.rescore();
        Ok(self.touch())
    }

    /// Image focus navigation; the index is taken modulo the region count.
    pub fn focus_region(&mut self, index: usize) -> Result<InteractionReport, InteractionError> {
        self.ensure_supported()?;
        let count = self
            .spec
            .region_count()
            .ok_or_else(|| self.not_applicable("focus_region"))?;
        if index >= count {
            return Err(InteractionError::InvalidPayload(format!(
                "region {} out of range (0..{})",
                index, count
            )));
        }
        if !self.interaction.can_interact() {
            return Err(self.invalid_phase("focus_region"));
        }
        self.interaction.sub_state = PluginSubState::ImageFocus {
            focused_region: index,
        };
        Ok(self.touch())
    }

    pub fn next_region(&mut self) -> Result<InteractionReport, InteractionError> {
        let (current, count) = self.region_cursor("next_region")?;
        self.focus_region((current + 1) % count)
    }

    pub fn previous_region(&mut self) -> Result<InteractionReport, InteractionError> {
        let (current, count) = self.region_cursor("previous_region")?;
        self.focus_region((current + count - 1) % count)
    }

    fn region_cursor(&self, operation: &'static str) -> Result<(usize, usize), InteractionError> {
        self.ensure_supported()?;
        let count = self
            .spec
            .region_count()
            .filter(|count| *count > 0)
            .ok_or_else(|| self.not_applicable(operation))?;
        let current = match self.interaction.sub_state {
            PluginSubState::ImageFocus { focused_region } => focused_region,
            _ => 0,
        };
        Ok((current, count))
    }

    fn with_locked_parts(&self, value: AnswerValue) -> AnswerValue {
        match (&self.interaction.sub_state, value) {
            (PluginSubState::PartialCredit { locked }, AnswerValue::Choices(chosen)) => {
                AnswerValue::Choices(chosen.union(locked).copied().collect())
            }
            (PluginSubState::Matching { matched_pairs }, AnswerValue::Pairs(given)) => {
                let matched_left: BTreeSet<usize> = matched_pairs.iter().map(|(l, _)| *l).collect();
                let mut merged: BTreeSet<(usize, usize)> = given
                    .into_iter()
                    .filter(|(l, _)| !matched_left.contains(l))
                    .collect();
                merged.extend(matched_pairs.iter().copied());
                AnswerValue::Pairs(merged)
            }
            (_, value) => value,
        }
    }

    fn lock_partial_credit(&mut self, value: &AnswerValue) {
        match (&self.spec, &mut self.interaction.sub_state, value) {
            (
                PluginSpec::MultipleAnswer { correct, .. },
                PluginSubState::PartialCredit { locked },
                AnswerValue::Choices(chosen),
            ) => {
                locked.extend(chosen.intersection(correct).copied());
            }
            (
                PluginSpec::Matching { pairs, .. },
                PluginSubState::Matching { matched_pairs },
                AnswerValue::Pairs(given),
            ) => {
                matched_pairs.extend(given.intersection(pairs).copied());
            }
            _ => {}
        }
    }

    fn rescore(&mut self) {
        self.interaction.score = self.model.score(&self.interaction);
    }

    fn touch(&mut self) -> InteractionReport {
        self.interaction.updated_at = Utc::now();
        self.report()
    }

    fn ensure_supported(&self) -> Result<(), InteractionError> {
        match &self.spec {
            PluginSpec::Unsupported { tag } => Err(InteractionError::Unsupported(tag.clone())),
            _ => Ok(()),
        }
    }

    fn ensure_answerable(&self, operation: &'static str) -> Result<(), InteractionError> {
        self.ensure_supported()?;
        if self.spec.is_answerable() {
            Ok(())
        } else {
            Err(self.not_applicable(operation))
        }
    }

    fn ensure_phase(
        &self,
        operation: &'static str,
        allowed: &[InteractionPhase],
    ) -> Result<(), InteractionError> {
        if allowed.contains(&self.interaction.phase) {
            return Ok(());
        }
        if self.interaction.phase == InteractionPhase::Completed {
            return Err(InteractionError::Completed);
        }
        Err(self.invalid_phase(operation))
    }

    fn invalid_phase(&self, operation: &'static str) -> InteractionError {
        if self.interaction.phase == InteractionPhase::Completed {
            return InteractionError::Completed;
        }
        InteractionError::InvalidPhase {
            operation,
            phase: self.interaction.phase.as_str(),
        }
    }

    fn not_applicable(&self, operation: &'static str) -> InteractionError {
        InteractionError::NotApplicable {
            operation,
            plugin: self.spec.name().to_string(),
        }
    }
}

fn shuffled_indices(len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut rand::rng());
    order
}
