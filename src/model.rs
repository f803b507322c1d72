use thiserror::Error;

use crate::message::MessageSequence;
use image::RgbImage;

/// Error raised by a model backend.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("tensor error: {0}")]
    Tensor(String),

    #[error("unsupported input: {0}")]
    Unsupported(String),
}

/// Where model weights live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    Accelerator,
    Host,
}

impl Placement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::Accelerator => "accelerator",
            Placement::Host => "host",
        }
    }
}

/// Numeric precision weights are materialized at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    Float32,
    BFloat16,
}

impl Precision {
    pub fn bytes_per_element(&self) -> u64 {
        match self {
            Precision::Float32 => 4,
            Precision::BFloat16 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Float32 => "f32",
            Precision::BFloat16 => "bf16",
        }
    }
}

/// One preprocessed image, channels-first and normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct PixelValues {
    pub data: Vec<f32>,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

/// Prompt tokens and image tensors in the model's input representation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodedInputs {
    pub input_ids: Vec<u32>,
    pub pixel_values: Vec<PixelValues>,
}

/// Sampling policy of a generation call.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    /// How many trailing tokens the repetition penalty looks at.
    pub repeat_last_n: usize,
    pub eos_token_id: u32,
    pub pad_token_id: u32,
}

impl GenerationParams {
    /// The fixed policy used by both design stages.
    pub fn sampling(max_new_tokens: usize, eos_token_id: u32) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.6,
            top_p: 0.9,
            repetition_penalty: 1.15,
            repeat_last_n: 64,
            eos_token_id,
            pad_token_id: eos_token_id,
        }
    }
}

/// Companion encoder/decoder of a [`VisionLanguageModel`].
pub trait Processor: Send + Sync {
    /// Renders the conversation in the model's chat format, ending with the
    /// cue that starts the assistant turn.
    fn apply_chat_template(&self, messages: &MessageSequence) -> String;

    fn encode(&self, prompt: &str, images: &[&RgbImage]) -> Result<EncodedInputs, ModelError>;

    /// Decodes token ids, skipping special tokens.
    fn decode(&self, token_ids: &[u32]) -> Result<String, ModelError>;

    fn eos_token_id(&self) -> u32;
}

/// A loaded vision-language model.
///
/// Calls are serialized by the inference engine; implementations never see
/// two concurrent `generate` calls.
pub trait VisionLanguageModel: Send {
    /// Returns the prompt tokens followed by the newly generated ones.
    fn generate(
        &mut self,
        inputs: &EncodedInputs,
        params: &GenerationParams,
    ) -> Result<Vec<u32>, ModelError>;

    /// Frees per-request accelerator memory such as the KV cache.
    fn release_cache(&mut self) {}
}
