use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use crate::{error::ConfigError, rules::RuleSet};

const GIB: u64 = 1024 * 1024 * 1024;

/// Essential items for one room type.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FurnitureEntry {
    #[serde(default)]
    pub essential: Vec<String>,
}

/// Material and palette for one design style.
///
/// Older catalogs name the material field `wood`, newer ones `materials`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StyleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materials: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materials_or_wood: Option<String>,
    #[serde(default)]
    pub colors: Vec<String>,
}

impl StyleEntry {
    pub fn materials_or_wood(&self) -> &str {
        self.materials
            .as_deref()
            .or(self.wood.as_deref())
            .or(self.materials_or_wood.as_deref())
            .unwrap_or("appropriate materials")
    }

    pub fn palette(&self) -> String {
        if self.colors.is_empty() {
            "cohesive colors".to_string()
        } else {
            self.colors.join(", ")
        }
    }
}

/// Furniture and style catalogs consumed by the placement prompt.
///
/// Missing sections and missing keys are tolerated; prompt assembly falls
/// back to generic text for them.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DesignCatalog {
    #[serde(rename = "FURNITURE_CONFIG", default)]
    pub furniture: HashMap<String, FurnitureEntry>,
    #[serde(rename = "STYLE_MATERIALS", default)]
    pub styles: HashMap<String, StyleEntry>,
    #[serde(rename = "DESIGN_RULES", default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleSet>,
}

impl DesignCatalog {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        let catalog = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Loaded design catalog from {}", path.display());
        Ok(catalog)
    }

    pub fn essential_furniture(&self, room_type: &str) -> Option<&[String]> {
        self.furniture
            .get(room_type)
            .map(|entry| entry.essential.as_slice())
    }

    pub fn style(&self, style: &str) -> Option<&StyleEntry> {
        self.styles.get(style)
    }

    pub fn room_types(&self) -> impl Iterator<Item = &str> {
        self.furniture.keys().map(String::as_str)
    }

    pub fn style_names(&self) -> impl Iterator<Item = &str> {
        self.styles.keys().map(String::as_str)
    }

    /// The configured rule set, or the standard one.
    pub fn rule_set(&self) -> RuleSet {
        self.rules.clone().unwrap_or_default()
    }
}

/// Memory ceilings used to plan where model layers live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MemoryBudget {
    pub accelerator_bytes: u64,
    pub host_bytes: u64,
}

impl MemoryBudget {
    pub fn gib(accelerator: u64, host: u64) -> Self {
        Self {
            accelerator_bytes: accelerator * GIB,
            host_bytes: host * GIB,
        }
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::gib(7, 15)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageSettings {
    pub min_width: u32,
    pub min_height: u32,
    pub fetch_timeout_secs: u64,
    /// Largest accepted width or height before decoding.
    pub max_dimension: u32,
    /// Largest allocation the decoder may make.
    pub max_alloc: u64,
}

impl ImageSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            min_width: 400,
            min_height: 400,
            fetch_timeout_secs: 10,
            max_dimension: 16_384,
            max_alloc: 512 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelSettings {
    pub model_id: String,
    /// Directory holding the tokenizer and safetensors. Without it the
    /// local Hugging Face cache is searched for `model_id`.
    pub model_dir: Option<PathBuf>,
    pub memory_budget: MemoryBudget,
    pub seed: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_id: "google/paligemma-3b-mix-224".to_string(),
            model_dir: None,
            memory_budget: MemoryBudget::default(),
            seed: 299_792_458,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Token budget of the analysis stage, independent of the request.
    pub analysis_max_tokens: usize,
    pub default_max_tokens: usize,
    pub generation_timeout_secs: u64,
}

impl GenerationSettings {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            analysis_max_tokens: 100,
            default_max_tokens: 180,
            generation_timeout_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DesignerSettings {
    pub image: ImageSettings,
    pub model: ModelSettings,
    pub generation: GenerationSettings,
}

impl DesignerSettings {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
