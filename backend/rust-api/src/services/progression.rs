use std::collections::HashMap;

use thiserror::Error;
use validator::Validate;

use crate::metrics::PROGRESS_REPORTS_TOTAL;
use crate::models::{BlockProgressSummary, InteractionReport, Session};

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("invalid interaction report: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("block {0} is not part of this session")]
    UnknownBlock(String),
}

/// Latest report per participant for each block of one session.
#[derive(Debug, Default)]
pub struct SessionProgress {
    reports: HashMap<String, HashMap<String, InteractionReport>>,
}

impl SessionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a learner report after validation. Invalid reports are
    /// logged and dropped.
    pub fn record(
        &mut self,
        session: &Session,
        report: InteractionReport,
    ) -> Result<BlockProgressSummary, ProgressError> {
        if let Err(e) = report.validate() {
            tracing::warn!(
                "Rejected interaction report for block {} from {}: {}",
                report.block_id,
                report.participant_id,
                e
            );
            PROGRESS_REPORTS_TOTAL.with_label_values(&["invalid"]).inc();
            return Err(e.into());
        }
        if session.block(&report.block_id).is_none() {
            PROGRESS_REPORTS_TOTAL
                .with_label_values(&["unknown_block"])
                .inc();
            return Err(ProgressError::UnknownBlock(report.block_id));
        }

        let block_id = report.block_id.clone();
        self.reports
            .entry(block_id.clone())
            .or_default()
            .insert(report.participant_id.clone(), report);
        PROGRESS_REPORTS_TOTAL.with_label_values(&["accepted"]).inc();
        Ok(self.summary(&block_id))
    }

    pub fn summary(&self, block_id: &str) -> BlockProgressSummary {
        let Some(reports) = self.reports.get(block_id) else {
            return BlockProgressSummary {
                block_id: block_id.to_string(),
                ..Default::default()
            };
        };

        let reported = reports.len();
        let completed = reports.values().filter(|r| r.is_complete).count();
        let total: u64 = reports.values().map(|r| u64::from(r.score)).sum();
        let average_score = if reported == 0 {
            0.0
        } else {
            total as f64 / reported as f64
        };

        BlockProgressSummary {
            block_id: block_id.to_string(),
            reported,
            completed,
            average_score,
        }
    }

    /// Progress of the block the cursor is on, if any.
    pub fn current(&self, session: &Session) -> Option<BlockProgressSummary> {
        session
            .current_block_id
            .as_deref()
            .map(|block_id| self.summary(block_id))
    }
}
