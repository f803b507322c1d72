use furnish_infernum::pipeline::{DEFAULT_ROOM_TYPE, DEFAULT_STYLE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_room_type() -> String {
    DEFAULT_ROOM_TYPE.to_string()
}

fn default_style() -> String {
    DEFAULT_STYLE.to_string()
}

/// Body of `POST /generate`. Exactly one image field must be set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateRequest {
    #[serde(default = "default_room_type")]
    pub room_type: String,
    #[serde(default = "default_style")]
    pub style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    /// Falls back to the server's configured placement budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub important_prompt: Option<String>,
}
