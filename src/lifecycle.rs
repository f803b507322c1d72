//! Model bring-up.
//!
//! Loading happens at most once per [`ModelLifecycle`]. On an accelerator the
//! parameter layout is read first (without touching weights) so layers that
//! do not fit the accelerator budget can be planned onto host memory instead
//! of failing the load.

use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use crate::{
    config::{MemoryBudget, ModelSettings},
    engine::{InferenceEngine, ModelHandle, ProcessorHandle},
    error::LoadError,
    model::{Placement, Precision, VisionLanguageModel},
};

/// Upper bound on a safetensors JSON header; anything larger is malformed.
const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;

/// Parameter bytes of one layer at the precision it will be loaded with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerFootprint {
    pub name: String,
    pub bytes: u64,
}

/// Layer-to-device assignment, in model order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceMap {
    entries: Vec<(String, Placement, u64)>,
}

impl DeviceMap {
    pub fn placement_of(&self, layer: &str) -> Option<Placement> {
        self.entries
            .iter()
            .find(|(name, _, _)| name == layer)
            .map(|(_, placement, _)| *placement)
    }

    pub fn bytes_on(&self, placement: Placement) -> u64 {
        self.entries
            .iter()
            .filter(|(_, p, _)| *p == placement)
            .map(|(_, _, bytes)| bytes)
            .sum()
    }

    pub fn offloaded_layers(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, p, _)| *p == Placement::Host)
            .count()
    }

    pub fn is_offloaded(&self) -> bool {
        self.offloaded_layers() > 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Placement)> {
        self.entries
            .iter()
            .map(|(name, placement, _)| (name.as_str(), *placement))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How the model is going to be materialized.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadPlan {
    pub model_id: String,
    pub placement: Placement,
    pub precision: Precision,
    /// Present only when loading onto an accelerator.
    pub device_map: Option<DeviceMap>,
}

/// Fills the accelerator budget with layers in model order and spills the
/// remainder to host memory.
///
/// Once one layer spills, every later layer stays on the host so activations
/// cross devices only once.
pub fn plan_device_map(
    layers: &[LayerFootprint],
    budget: &MemoryBudget,
) -> Result<DeviceMap, LoadError> {
    let mut map = DeviceMap::default();
    let mut accelerator_used = 0u64;
    let mut host_used = 0u64;
    let mut spilled = false;

    for layer in layers {
        let fits = accelerator_used
            .checked_add(layer.bytes)
            .is_some_and(|total| total <= budget.accelerator_bytes);
        let placement = if !spilled && fits {
            accelerator_used += layer.bytes;
            Placement::Accelerator
        } else {
            spilled = true;
            host_used = host_used.saturating_add(layer.bytes);
            Placement::Host
        };
        map.entries.push((layer.name.clone(), placement, layer.bytes));
    }

    if host_used > budget.host_bytes {
        return Err(LoadError::InsufficientMemory {
            required: accelerator_used.saturating_add(host_used),
            available: budget.host_bytes,
        });
    }
    Ok(map)
}

#[derive(Deserialize)]
struct TensorHeader {
    shape: Vec<u64>,
}

/// Groups the tensors listed in safetensors headers into layers.
///
/// Only the JSON headers are read; no weight data is loaded.
pub fn read_layer_footprints(
    files: &[PathBuf],
    precision: Precision,
) -> Result<Vec<LayerFootprint>, LoadError> {
    let mut layers: BTreeMap<Vec<Segment>, LayerFootprint> = BTreeMap::new();

    for file in files {
        for (tensor, elements) in read_header(file)? {
            let name = layer_name(&tensor);
            let entry = layers
                .entry(natural_key(&name))
                .or_insert_with(|| LayerFootprint {
                    name,
                    bytes: 0,
                });
            entry.bytes += elements * precision.bytes_per_element();
        }
    }

    Ok(layers.into_values().collect())
}

fn read_header(path: &Path) -> Result<Vec<(String, u64)>, LoadError> {
    let inspect_err =
        |message: String| LoadError::Inspect(format!("{}: {message}", path.display()));

    let mut reader = BufReader::new(File::open(path).map_err(|e| inspect_err(e.to_string()))?);
    let mut len = [0u8; 8];
    reader
        .read_exact(&mut len)
        .map_err(|e| inspect_err(e.to_string()))?;
    let len = u64::from_le_bytes(len);
    if len > MAX_HEADER_BYTES {
        return Err(inspect_err(format!("header of {len} bytes is too large")));
    }

    let mut header = Vec::new();
    reader
        .take(len)
        .read_to_end(&mut header)
        .map_err(|e| inspect_err(e.to_string()))?;
    let header: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&header).map_err(|e| inspect_err(e.to_string()))?;

    header
        .into_iter()
        .filter(|(name, _)| name != "__metadata__")
        .map(|(name, value)| {
            let tensor: TensorHeader =
                serde_json::from_value(value).map_err(|e| inspect_err(format!("{name}: {e}")))?;
            Ok((name, tensor.shape.iter().product()))
        })
        .collect()
}

/// `a.b.layers.3.mlp.w` belongs to layer `a.b.layers.3`; tensors outside
/// numbered blocks belong to their top-level module.
fn layer_name(tensor: &str) -> String {
    let parts: Vec<&str> = tensor.split('.').collect();
    if let Some(idx) = parts
        .iter()
        .position(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
    {
        return parts[..=idx].join(".");
    }
    match parts.as_slice() {
        [only] => only.to_string(),
        [first, second, ..] if parts.len() > 2 => format!("{first}.{second}"),
        [first, ..] => first.to_string(),
        [] => String::new(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Text(String),
    Number(u64),
}

fn natural_key(name: &str) -> Vec<Segment> {
    name.split('.')
        .map(|part| match part.parse::<u64>() {
            Ok(n) => Segment::Number(n),
            Err(_) => Segment::Text(part.to_string()),
        })
        .collect()
}

/// Backend that knows how to find and materialize one model class.
pub trait ModelLoader: Send + Sync {
    fn accelerator_available(&self) -> bool;

    /// Parameter layout of the model at `precision`, without loading weights.
    fn inspect(
        &self,
        model_id: &str,
        precision: Precision,
    ) -> Result<Vec<LayerFootprint>, LoadError>;

    /// Whether one model can straddle accelerator and host memory. Loaders
    /// that cannot are planned entirely on the host when layers spill.
    fn splits_layers(&self) -> bool {
        false
    }

    fn materialize(&self, plan: &LoadPlan) -> Result<Box<dyn VisionLanguageModel>, LoadError>;

    fn load_processor(&self, model_id: &str) -> Result<ProcessorHandle, LoadError>;
}

/// Loads the model and processor once and hands out the shared engine.
///
/// Concurrent first callers block until the single load finishes and all
/// observe the same result. A failed load is remembered and never retried.
pub struct ModelLifecycle<L: ModelLoader> {
    loader: L,
    settings: ModelSettings,
    generation_timeout: Duration,
    loaded: OnceLock<Result<Arc<InferenceEngine>, LoadError>>,
}

impl<L: ModelLoader> ModelLifecycle<L> {
    pub fn new(loader: L, settings: ModelSettings, generation_timeout: Duration) -> Self {
        Self {
            loader,
            settings,
            generation_timeout,
            loaded: OnceLock::new(),
        }
    }

    pub fn ensure_loaded(&self) -> Result<Arc<InferenceEngine>, LoadError> {
        self.loaded.get_or_init(|| self.load()).clone()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.loaded.get(), Some(Ok(_)))
    }

    /// Decides device, precision and layer placement for this host.
    pub fn plan(&self) -> Result<LoadPlan, LoadError> {
        let model_id = self.settings.model_id.clone();
        if !self.loader.accelerator_available() {
            log::info!("No accelerator detected, loading '{model_id}' on host memory");
            return self.host_plan(model_id);
        }

        let precision = Precision::BFloat16;
        let layers = self.loader.inspect(&model_id, precision)?;
        let device_map = plan_device_map(&layers, &self.settings.memory_budget)?;
        let offloaded = device_map.offloaded_layers();
        log::info!(
            "Accelerator detected: {} of {} layers on accelerator ({} bytes), \
             {offloaded} offloaded to host ({} bytes)",
            device_map.len() - offloaded,
            device_map.len(),
            device_map.bytes_on(Placement::Accelerator),
            device_map.bytes_on(Placement::Host),
        );

        if offloaded > 0 && !self.loader.splits_layers() {
            log::warn!(
                "'{model_id}' cannot be split across devices and {offloaded} layers exceed the \
                 accelerator budget, loading it on host memory instead"
            );
            return self.host_plan(model_id);
        }

        Ok(LoadPlan {
            model_id,
            placement: Placement::Accelerator,
            precision,
            device_map: Some(device_map),
        })
    }

    /// The whole model in host memory at full precision, checked against the
    /// host budget.
    fn host_plan(&self, model_id: String) -> Result<LoadPlan, LoadError> {
        let precision = Precision::Float32;
        let required = self
            .loader
            .inspect(&model_id, precision)?
            .iter()
            .fold(0u64, |total, layer| total.saturating_add(layer.bytes));
        let available = self.settings.memory_budget.host_bytes;
        if required > available {
            return Err(LoadError::InsufficientMemory {
                required,
                available,
            });
        }

        Ok(LoadPlan {
            model_id,
            placement: Placement::Host,
            precision,
            device_map: None,
        })
    }

    fn load(&self) -> Result<Arc<InferenceEngine>, LoadError> {
        let start_time = Instant::now();
        let plan = self.plan()?;

        log::info!(
            "Loading model '{}' onto {} at {}",
            plan.model_id,
            plan.placement.as_str(),
            plan.precision.as_str()
        );
        let model = self.loader.materialize(&plan)?;

        log::info!("Loading processor for '{}'", plan.model_id);
        let processor = self.loader.load_processor(&plan.model_id)?;

        let load_time = start_time.elapsed();
        log::info!(
            "Model and processor loaded in {:.2} seconds",
            load_time.as_secs_f64()
        );
        Ok(Arc::new(InferenceEngine::new(
            ModelHandle {
                model,
                plan,
                load_time,
            },
            processor,
            self.generation_timeout,
        )))
    }
}
