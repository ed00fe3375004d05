use serde::{Deserialize, Serialize};

use super::session::Session;

/// Aggregate of interaction reports for the current block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BlockProgressSummary {
    pub block_id: String,
    pub reported: usize,
    pub completed: usize,
    pub average_score: f64,
}

/// What the host console renders: the effective session plus the actions
/// that are legal right now.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionView {
    pub session: Session,
    pub connected: bool,
    pub pending_commands: usize,
    pub countdown: Option<u8>,
    pub last_error: Option<String>,
    pub legal_actions: Vec<String>,
    pub progress: Option<BlockProgressSummary>,
}

impl SessionView {
    pub fn allows(&self, action: &str) -> bool {
        self.legal_actions.iter().any(|legal| legal == action)
    }
}
