use image::RgbImage;

use crate::{
    error::InferenceError,
    message::{MessageSequence, Role},
    model::{GenerationParams, Processor, VisionLanguageModel},
};

/// Images attached to user turns, in conversation order.
pub fn collect_images(messages: &MessageSequence) -> Vec<&RgbImage> {
    messages
        .messages()
        .iter()
        .filter(|m| m.role() == Role::User)
        .flat_map(|m| m.images())
        .map(|image| image.pixels())
        .collect()
}

/// Runs one generation call and returns only the newly generated text.
///
/// Any failure while encoding, generating or decoding yields an error and
/// no text at all.
pub fn run_generation(
    model: &mut dyn VisionLanguageModel,
    processor: &dyn Processor,
    messages: &MessageSequence,
    max_new_tokens: usize,
) -> Result<String, InferenceError> {
    let prompt = processor.apply_chat_template(messages);
    let images = collect_images(messages);

    let inputs = processor
        .encode(&prompt, &images)
        .map_err(InferenceError::Encode)?;
    let prompt_len = inputs.input_ids.len();

    let params = GenerationParams::sampling(max_new_tokens, processor.eos_token_id());
    let sequence = model
        .generate(&inputs, &params)
        .map_err(InferenceError::Generate)?;

    let generated = sequence.get(prompt_len..).unwrap_or_default();
    log::debug!(
        "Generated {} new tokens after a {prompt_len} token prompt",
        generated.len()
    );

    let text = processor.decode(generated).map_err(InferenceError::Decode)?;
    Ok(text.trim().to_string())
}
