use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    Pending,
    Active,
    Locked,
    Skipped,
    Completed,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Active => "active",
            BlockStatus::Locked => "locked",
            BlockStatus::Skipped => "skipped",
            BlockStatus::Completed => "completed",
        }
    }
}

impl FromStr for BlockStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(BlockStatus::Pending),
            "active" => Ok(BlockStatus::Active),
            "locked" => Ok(BlockStatus::Locked),
            "skipped" => Ok(BlockStatus::Skipped),
            "completed" => Ok(BlockStatus::Completed),
            _ => Err(format!("Invalid block status: {}", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    #[default]
    Manual,
    Autoplay,
    Loop,
}

fn default_weight() -> u32 {
    100
}

/// Block settings. Known keys are typed; everything else a plugin needs is
/// kept in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockSettings {
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub playback_mode: PlaybackMode,
    #[serde(default)]
    pub auto_advance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_advance_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_per_attempt: Option<u32>,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            weight: default_weight(),
            playback_mode: PlaybackMode::default(),
            auto_advance: false,
            auto_advance_delay_ms: None,
            max_score: None,
            penalty_per_attempt: None,
            shuffle: false,
            extra: serde_json::Map::new(),
        }
    }
}

/// One unit of lesson content in a session's ordered block list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub id: String,
    pub position: u32,
    pub plugin: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default)]
    pub settings: BlockSettings,
    #[serde(default)]
    pub status: BlockStatus,
    #[serde(default)]
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_keep_plugin_specific_keys() {
        let settings: BlockSettings = serde_json::from_value(json!({
            "weight": 20,
            "auto_advance": true,
            "required_ratio": 0.8
        }))
        .unwrap();

        assert_eq!(settings.weight, 20);
        assert!(settings.auto_advance);
        assert_eq!(settings.playback_mode, PlaybackMode::Manual);
        assert_eq!(settings.extra.get("required_ratio"), Some(&json!(0.8)));
    }

    #[test]
    fn missing_weight_defaults_to_100() {
        let settings: BlockSettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings.weight, 100);
    }

    #[test]
    fn block_status_names() {
        assert_eq!(BlockStatus::Skipped.as_str(), "skipped");
        assert_eq!("locked".parse::<BlockStatus>(), Ok(BlockStatus::Locked));
        assert!("done".parse::<BlockStatus>().is_err());
    }
}
