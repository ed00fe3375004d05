pub mod machine;
pub mod plugins;
pub mod scoring;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use validator::Validate;

use crate::models::{
    Block, InteractionKey, InteractionMode, InteractionOp, InteractionReport,
};
use crate::services::interaction_store::InteractionRepository;

pub use machine::InteractionMachine;
pub use plugins::PluginSpec;
pub use scoring::{ScoreModel, ScoringPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InteractionError {
    #[error("no answer selected")]
    NoSelection,
    #[error("interaction already completed")]
    Completed,
    #[error("{operation} is not allowed while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: &'static str,
    },
    #[error("{operation} does not apply to {plugin} blocks")]
    NotApplicable {
        operation: &'static str,
        plugin: String,
    },
    #[error("invalid answer payload: {0}")]
    InvalidPayload(String),
    #[error("invalid block content: {0}")]
    InvalidContent(String),
    #[error("plugin '{0}' is not supported")]
    Unsupported(String),
    #[error("invalid interaction report: {0}")]
    InvalidReport(String),
    #[error("interaction storage failed: {0}")]
    Storage(String),
}

/// Loads, drives and stores interaction machines. Play-mode interactions
/// are persisted through the repository; preview ones live in memory only.
///
/// Operations on the same interaction key run one at a time: the key's lock
/// is held from load to save.
pub struct InteractionService {
    repository: Arc<dyn InteractionRepository>,
    policy: ScoringPolicy,
    previews: Mutex<HashMap<String, crate::models::Interaction>>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InteractionService {
    pub fn new(repository: Arc<dyn InteractionRepository>, policy: ScoringPolicy) -> Self {
        Self {
            repository,
            policy,
            previews: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.in_flight.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(document_id.to_string()).or_default().clone()
    }

    pub async fn apply(
        &self,
        mode: InteractionMode,
        key: &InteractionKey,
        block: &Block,
        op: InteractionOp,
    ) -> Result<InteractionReport, InteractionError> {
        let lock = self.key_lock(&key.document_id()).await;
        let _guard = lock.lock().await;

        let stored = match mode {
            InteractionMode::Play => self
                .repository
                .load(key)
                .await
                .map_err(|e| InteractionError::Storage(format!("{:#}", e)))?,
            InteractionMode::Preview => self.previews.lock().await.get(&key.document_id()).cloned(),
        };

        let mut machine = match stored {
            Some(interaction) => InteractionMachine::restore(interaction, block, &self.policy)?,
            None => InteractionMachine::new(key, block, &self.policy)?,
        };

        let report = match op {
            InteractionOp::Select { value } => machine.select(value),
            InteractionOp::CheckAnswer => machine.check_answer(),
            InteractionOp::TryAgain => machine.try_again(),
            InteractionOp::RevealCorrectAnswer => machine.reveal_correct_answer(),
            InteractionOp::Complete => machine.complete(),
            InteractionOp::Reset => machine.reset(mode),
            InteractionOp::RecordListening { seconds } => machine.record_listening(seconds),
            InteractionOp::MarkViewed => machine.mark_viewed(),
            InteractionOp::FocusRegion { index } => machine.focus_region(index),
            InteractionOp::NextRegion => machine.next_region(),
            InteractionOp::PreviousRegion => machine.previous_region(),
        }?;
        report
            .validate()
            .map_err(|e| InteractionError::InvalidReport(e.to_string()))?;

        let interaction = machine.into_interaction();
        match mode {
            InteractionMode::Play => {
                self.repository
                    .save(&interaction)
                    .await
                    .map_err(|e| InteractionError::Storage(format!("{:#}", e)))?;
            }
            InteractionMode::Preview => {
                self.previews
                    .lock()
                    .await
                    .insert(interaction.id.clone(), interaction);
            }
        }

        tracing::debug!(
            "Interaction {} now {} (score={}, attempts={})",
            key.document_id(),
            report.snapshot.phase.as_str(),
            report.score,
            report.attempts
        );
        Ok(report)
    }

    /// Persisted interactions of one block, as reports.
    pub async fn list(
        &self,
        scope_id: &str,
        block_id: &str,
    ) -> Result<Vec<InteractionReport>, InteractionError> {
        let interactions = self
            .repository
            .list_for_block(scope_id, block_id)
            .await
            .map_err(|e| InteractionError::Storage(format!("{:#}", e)))?;
        Ok(interactions
            .iter()
            .map(InteractionReport::from_interaction)
            .collect())
    }
}
