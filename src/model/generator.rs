use rand::Rng;

use crate::{
    error::EngineError,
    model::{Completion, GenerationParams, ModelMetadata},
    sampling,
};

/// A loaded tokenizer + causal language model pair.
///
/// Implementations are shared across request handlers and must serialize
/// access to any state that is not safe for concurrent decoding.
pub trait TextGenerator: Send + Sync {
    fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<Completion, EngineError>;

    fn metadata(&self) -> ModelMetadata;
}

/// Autoregressive decode loop.
///
/// `forward` receives the full sequence so far and returns the logits for the
/// next position. Stops at `eos_id` or once the sequence reaches
/// `params.max_length`. Returns only the newly generated ids.
pub fn decode_tokens<F, R>(
    prompt_ids: &[u32],
    params: &GenerationParams,
    eos_id: Option<u32>,
    rng: &mut R,
    mut forward: F,
) -> Result<Vec<u32>, EngineError>
where
    F: FnMut(&[u32]) -> Result<Vec<f32>, EngineError>,
    R: Rng + ?Sized,
{
    let mut ids = prompt_ids.to_vec();
    let mut generated = Vec::new();

    while ids.len() < params.max_length {
        let mut logits = forward(&ids)?;
        let next = sampling::select_token(&mut logits, &ids, params, rng)
            .ok_or_else(|| EngineError::Generation("model returned empty logits".into()))?;
        if Some(next) == eos_id {
            break;
        }
        ids.push(next);
        generated.push(next);
    }

    Ok(generated)
}
