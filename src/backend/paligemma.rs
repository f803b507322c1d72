use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::{LogitsProcessor, Sampling},
    models::paligemma::{Config, Model},
    utils::apply_repeat_penalty,
};
use image::{RgbImage, imageops::FilterType};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokenizers::Tokenizer;

use super::ModelFiles;
use crate::{
    config::ModelSettings,
    engine::ProcessorHandle,
    error::LoadError,
    lifecycle::{LayerFootprint, LoadPlan, ModelLoader, read_layer_footprints},
    message::MessageSequence,
    model::{
        EncodedInputs, GenerationParams, ModelError, PixelValues, Placement, Precision, Processor,
        VisionLanguageModel,
    },
};

const EOS_TOKEN: &str = "<eos>";

/// Architecture and input resolution are read off the checkpoint name.
fn config_for(model_id: &str) -> Config {
    let id = model_id.to_ascii_lowercase();
    match (id.contains("paligemma2"), id.contains("896"), id.contains("448")) {
        (true, true, _) => Config::paligemma_2_3b_896(),
        (true, false, true) => Config::paligemma_2_3b_448(),
        (true, false, false) => Config::paligemma_2_3b_224(),
        (false, _, true) => Config::paligemma_3b_448(),
        (false, _, false) => Config::paligemma_3b_224(),
    }
}

/// Finds and loads PaliGemma checkpoints stored as safetensors.
pub struct PaligemmaLoader {
    model_dir: Option<PathBuf>,
    seed: u64,
}

impl PaligemmaLoader {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            model_dir: settings.model_dir.clone(),
            seed: settings.seed,
        }
    }

    fn files(&self, model_id: &str) -> Result<ModelFiles, LoadError> {
        ModelFiles::locate(model_id, self.model_dir.as_deref())
    }
}

impl ModelLoader for PaligemmaLoader {
    fn accelerator_available(&self) -> bool {
        Device::new_cuda(0).is_ok()
    }

    fn inspect(
        &self,
        model_id: &str,
        precision: Precision,
    ) -> Result<Vec<LayerFootprint>, LoadError> {
        read_layer_footprints(&self.files(model_id)?.weights, precision)
    }

    fn materialize(&self, plan: &LoadPlan) -> Result<Box<dyn VisionLanguageModel>, LoadError> {
        let files = self.files(&plan.model_id)?;
        let device = match plan.placement {
            Placement::Accelerator => {
                Device::new_cuda(0).map_err(|e| LoadError::Materialize(e.to_string()))?
            }
            Placement::Host => Device::Cpu,
        };
        let dtype = match plan.precision {
            Precision::BFloat16 => DType::BF16,
            Precision::Float32 => DType::F32,
        };

        // SAFETY: the weight files are not modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(files.weights.as_slice(), dtype, &device)
        }
        .map_err(|e| LoadError::Materialize(e.to_string()))?;
        let model = Model::new(&config_for(&plan.model_id), vb)
            .map_err(|e| LoadError::Materialize(e.to_string()))?;

        Ok(Box::new(PaligemmaModel {
            model,
            device,
            dtype,
            seed: self.seed,
            calls: 0,
        }))
    }

    fn load_processor(&self, model_id: &str) -> Result<ProcessorHandle, LoadError> {
        let files = self.files(model_id)?;
        let image_size = config_for(model_id).vision_config.image_size;
        let processor = PaligemmaProcessor::from_file(&files.tokenizer, image_size)?;
        Ok(Arc::new(processor))
    }
}

pub struct PaligemmaModel {
    model: Model,
    device: Device,
    dtype: DType,
    seed: u64,
    calls: u64,
}

impl VisionLanguageModel for PaligemmaModel {
    fn generate(
        &mut self,
        inputs: &EncodedInputs,
        params: &GenerationParams,
    ) -> Result<Vec<u32>, ModelError> {
        let [pixels] = inputs.pixel_values.as_slice() else {
            return Err(ModelError::Unsupported(format!(
                "expected exactly one image, got {}",
                inputs.pixel_values.len()
            )));
        };
        if inputs.input_ids.is_empty() {
            return Err(ModelError::Unsupported("empty prompt".to_string()));
        }

        let pixel_values = Tensor::from_slice(
            &pixels.data,
            (1, pixels.channels, pixels.height, pixels.width),
            &self.device,
        )?
        .to_dtype(self.dtype)?;

        let mut logits_processor = LogitsProcessor::from_sampling(
            self.seed.wrapping_add(self.calls),
            Sampling::TopP {
                p: params.top_p,
                temperature: params.temperature,
            },
        );
        self.calls += 1;

        let mut tokens = inputs.input_ids.clone();
        for index in 0..params.max_new_tokens {
            let context = if index == 0 {
                &tokens[..]
            } else {
                &tokens[tokens.len() - 1..]
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = if index == 0 {
                self.model.setup(&pixel_values, &input)?
            } else {
                self.model.forward(&input)?
            };
            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;

            let start_at = tokens.len().saturating_sub(params.repeat_last_n);
            let logits =
                apply_repeat_penalty(&logits, params.repetition_penalty, &tokens[start_at..])?;

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if next_token == params.eos_token_id {
                break;
            }
        }
        Ok(tokens)
    }

    fn release_cache(&mut self) {
        self.model.clear_kv_cache();
    }
}

/// Tokenizer plus SigLIP image preprocessing.
pub struct PaligemmaProcessor {
    tokenizer: Tokenizer,
    image_size: usize,
    eos_token_id: u32,
}

impl PaligemmaProcessor {
    pub fn from_file(path: &Path, image_size: usize) -> Result<Self, LoadError> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| LoadError::Processor(format!("{}: {e}", path.display())))?;
        let eos_token_id = tokenizer
            .token_to_id(EOS_TOKEN)
            .ok_or_else(|| LoadError::Processor(format!("tokenizer has no {EOS_TOKEN} token")))?;
        Ok(Self {
            tokenizer,
            image_size,
            eos_token_id,
        })
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

impl Processor for PaligemmaProcessor {
    fn apply_chat_template(&self, messages: &MessageSequence) -> String {
        render_chat(messages)
    }

    fn encode(&self, prompt: &str, images: &[&RgbImage]) -> Result<EncodedInputs, ModelError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        Ok(EncodedInputs {
            input_ids: encoding.get_ids().to_vec(),
            pixel_values: images
                .iter()
                .map(|image| preprocess(image, self.image_size))
                .collect(),
        })
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String, ModelError> {
        self.tokenizer
            .decode(token_ids, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}

/// PaliGemma has no chat format: turns are flattened into one prefix and the
/// trailing newline separates it from the answer.
fn render_chat(messages: &MessageSequence) -> String {
    let mut prompt = messages
        .messages()
        .iter()
        .map(|m| m.text())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    prompt.push('\n');
    prompt
}

/// Squashes the photo to `size`x`size` (no crop, so walls at the border stay
/// visible) and rescales channels to [-1, 1] in CHW order.
fn preprocess(image: &RgbImage, size: usize) -> PixelValues {
    let side = u32::try_from(size).unwrap_or(u32::MAX);
    let resized = image::imageops::resize(image, side, side, FilterType::Triangle);

    let plane = size * size;
    let mut data = vec![0f32; 3 * plane];
    for (i, pixel) in resized.pixels().enumerate() {
        for (channel, value) in pixel.0.iter().enumerate() {
            data[channel * plane + i] = f32::from(*value) * (2.0 / 255.0) - 1.0;
        }
    }

    PixelValues {
        data,
        channels: 3,
        height: size,
        width: size,
    }
}
