use serde::{Deserialize, Serialize};

use super::session::{BlockPatch, SessionPatch};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedTable {
    Sessions,
    Blocks,
}

impl FeedTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTable::Sessions => "sessions",
            FeedTable::Blocks => "blocks",
        }
    }
}

/// "Row updated" notification, also returned by the command sink as the
/// result of a single-row update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub table: FeedTable,
    pub row_id: String,
    pub changed_fields: serde_json::Map<String, serde_json::Value>,
}

pub type RowUpdate = ChangeEvent;

/// Typed view of a change event.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Session(SessionPatch),
    Block { block_id: String, patch: BlockPatch },
}

impl RowChange {
    pub fn version(&self) -> Option<u64> {
        match self {
            RowChange::Session(patch) => patch.version,
            RowChange::Block { patch, .. } => patch.version,
        }
    }
}

impl ChangeEvent {
    pub fn session(session_id: &str, patch: &SessionPatch) -> serde_json::Result<Self> {
        Ok(Self {
            table: FeedTable::Sessions,
            row_id: session_id.to_string(),
            changed_fields: to_fields(patch)?,
        })
    }

    pub fn block(block_id: &str, patch: &BlockPatch) -> serde_json::Result<Self> {
        Ok(Self {
            table: FeedTable::Blocks,
            row_id: block_id.to_string(),
            changed_fields: to_fields(patch)?,
        })
    }

    pub fn to_change(&self) -> serde_json::Result<RowChange> {
        let fields = serde_json::Value::Object(self.changed_fields.clone());
        match self.table {
            FeedTable::Sessions => Ok(RowChange::Session(serde_json::from_value(fields)?)),
            FeedTable::Blocks => Ok(RowChange::Block {
                block_id: self.row_id.clone(),
                patch: serde_json::from_value(fields)?,
            }),
        }
    }
}

fn to_fields<T: Serialize>(value: &T) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Ok(serde_json::Map::new()),
    }
}

/// Messages delivered by a change-feed subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Connected,
    Event(ChangeEvent),
    Disconnected { reason: String },
}
