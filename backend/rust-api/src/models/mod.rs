use serde::Deserialize;

pub mod action;
pub mod block;
pub mod command;
pub mod feed;
pub mod interaction;
pub mod play_state;
pub mod session;
pub mod timer;
pub mod view;

pub use action::HostAction;
pub use block::{Block, BlockSettings, BlockStatus, PlaybackMode};
pub use command::{Command, CommandEnvelope};
pub use feed::{ChangeEvent, FeedMessage, FeedTable, RowChange, RowUpdate};
pub use interaction::{
    AnswerValue, Interaction, InteractionKey, InteractionMode, InteractionOp, InteractionPhase,
    InteractionReport,
};
pub use play_state::PlayState;
pub use session::{
    BlockPatch, ChatMode, ControlMode, PauseReason, Session, SessionMode, SessionPatch,
    SessionStatus,
};
pub use view::{BlockProgressSummary, SessionView};

/// Scheduling request: stores a `draft` session with its blocks.
#[derive(Debug, Deserialize, validator::Validate)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub mode: SessionMode,
    #[validate(length(min = 1, max = 200))]
    pub blocks: Vec<NewBlock>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
pub struct NewBlock {
    pub plugin: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub settings: BlockSettings,
}

// `Option<Option<T>>` fields: absent stays `None`, explicit null becomes `Some(None)`.
pub(crate) mod nullable {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}
