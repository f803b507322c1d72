//! Candle implementation of the model seam.

pub mod paligemma;

pub use paligemma::{PaligemmaLoader, PaligemmaModel, PaligemmaProcessor};

use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    env,
    path::{Path, PathBuf},
};

use crate::{error::LoadError, model::ModelError};

impl From<candle_core::Error> for ModelError {
    fn from(e: candle_core::Error) -> Self {
        ModelError::Tensor(e.to_string())
    }
}

const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

/// Tokenizer and weight shards of one model on local disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Looks in `model_dir` when given, otherwise in the newest snapshot of
    /// `model_id` in the local Hugging Face cache.
    pub fn locate(model_id: &str, model_dir: Option<&Path>) -> Result<Self, LoadError> {
        let not_found = |message: String| LoadError::NotFound {
            model_id: model_id.to_string(),
            message,
        };

        let dir = match model_dir {
            Some(dir) => dir.to_path_buf(),
            None => {
                let cache = hub_cache_dir()
                    .ok_or_else(|| not_found("no model_dir and no cache directory".to_string()))?;
                snapshot_dir(&cache, model_id)
                    .ok_or_else(|| not_found(format!("not cached under {}", cache.display())))?
            }
        };

        let tokenizer = dir.join(TOKENIZER_FILE);
        if !tokenizer.is_file() {
            return Err(not_found(format!("missing {}", tokenizer.display())));
        }

        let weights = weight_files(&dir).map_err(not_found)?;
        log::debug!(
            "Model '{model_id}' resolved to {} ({} weight files)",
            dir.display(),
            weights.len()
        );
        Ok(Self { tokenizer, weights })
    }
}

fn weight_files(dir: &Path) -> Result<Vec<PathBuf>, String> {
    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    if index_path.is_file() {
        let raw = std::fs::read_to_string(&index_path)
            .map_err(|e| format!("{}: {e}", index_path.display()))?;
        let index: WeightsIndex =
            serde_json::from_str(&raw).map_err(|e| format!("{}: {e}", index_path.display()))?;
        let shards: BTreeSet<String> = index.weight_map.into_values().collect();
        let files: Vec<PathBuf> = shards.into_iter().map(|shard| dir.join(shard)).collect();
        if let Some(missing) = files.iter().find(|f| !f.is_file()) {
            return Err(format!("missing shard {}", missing.display()));
        }
        return Ok(files);
    }

    let single = dir.join(SINGLE_WEIGHTS_FILE);
    if single.is_file() {
        Ok(vec![single])
    } else {
        Err(format!("no safetensors found in {}", dir.display()))
    }
}

fn hub_cache_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("HF_HUB_CACHE") {
        return Some(PathBuf::from(dir));
    }
    if let Some(home) = env::var_os("HF_HOME") {
        return Some(PathBuf::from(home).join("hub"));
    }
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache/huggingface/hub"))
}

/// `org/name` is cached as `models--org--name/snapshots/<revision>`; the
/// revision named by `refs/main` wins, else the last one listed.
fn snapshot_dir(cache: &Path, model_id: &str) -> Option<PathBuf> {
    let repo = cache.join(format!("models--{}", model_id.replace('/', "--")));
    let snapshots = repo.join("snapshots");

    if let Ok(revision) = std::fs::read_to_string(repo.join("refs").join("main")) {
        let dir = snapshots.join(revision.trim());
        if dir.is_dir() {
            return Some(dir);
        }
    }

    let mut revisions: Vec<PathBuf> = std::fs::read_dir(&snapshots)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    revisions.sort();
    revisions.pop()
}
