use serde::Serialize;

use crate::quantization::QuantizationSummary;

/// Decoding controls. `max_length` counts prompt tokens as well.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationParams {
    pub max_length: usize,
    pub do_sample: bool,
    pub temperature: f32,
    /// Zero disables the top-k cut.
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    #[serde(skip)]
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 400,
            do_sample: true,
            temperature: 0.7,
            top_k: 50,
            top_p: 0.9,
            repetition_penalty: 1.1,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterMetadata {
    pub path: String,
    pub rank: usize,
    pub alpha: f64,
    pub merged_tensors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub base_model: String,
    pub device: String,
    pub dtype: String,
    pub adapter: AdapterMetadata,
    pub quantization: Option<QuantizationSummary>,
}

/// Statistics for a single completion, logged after every request.
#[derive(Debug, Clone)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub total_time_ms: u128,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> f64 {
        if self.total_time_ms == 0 {
            self.generated_tokens as f64
        } else {
            self.generated_tokens as f64 * 1000.0 / self.total_time_ms as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub stats: GenerationStats,
}
