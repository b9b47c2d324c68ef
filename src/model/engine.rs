use std::sync::Arc;

use tokio::task;
use tracing::{error, info};

use crate::{
    config::AppConfig,
    error::EngineError,
    model::{GenerationParams, ModelMetadata, TextGenerator},
};

pub fn build_prompt(question: &str) -> String {
    format!("Question: {question}\nAnswer:")
}

/// Removes every echo of `prompt` from the decoded text and trims it.
pub fn strip_prompt(output: &str, prompt: &str) -> String {
    output.replace(prompt, "").trim().to_string()
}

enum EngineState {
    Ready(Arc<dyn TextGenerator>),
    Unavailable { reason: String },
}

/// The legal question answering engine shared by all request handlers.
///
/// Built once at startup. A failed load leaves it permanently unavailable;
/// there is no reload within the process.
pub struct LegalAssistant {
    state: EngineState,
    params: GenerationParams,
}

impl LegalAssistant {
    /// Loads the model, degrading to an unavailable engine on any failure.
    pub fn initialize(config: &AppConfig) -> Self {
        info!(
            base_model = %config.base_model_id,
            adapter = %config.adapter_path.display(),
            "initializing legal assistant"
        );
        match load_generator(config) {
            Ok(generator) => {
                info!("legal assistant initialized");
                Self::ready(generator, config.generation.clone())
            }
            Err(err) => {
                error!(error = %err, "model failed to load; serving degraded responses");
                Self::unavailable(err.to_string())
            }
        }
    }

    pub fn ready(generator: Arc<dyn TextGenerator>, params: GenerationParams) -> Self {
        Self {
            state: EngineState::Ready(generator),
            params,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            state: EngineState::Unavailable {
                reason: reason.into(),
            },
            params: GenerationParams::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, EngineState::Ready(_))
    }

    pub fn load_error(&self) -> Option<&str> {
        match &self.state {
            EngineState::Ready(_) => None,
            EngineState::Unavailable { reason } => Some(reason.as_str()),
        }
    }

    pub fn metadata(&self) -> Option<ModelMetadata> {
        match &self.state {
            EngineState::Ready(generator) => Some(generator.metadata()),
            EngineState::Unavailable { .. } => None,
        }
    }

    pub async fn generate_answer(&self, question: &str) -> Result<String, EngineError> {
        let generator = match &self.state {
            EngineState::Ready(generator) => generator.clone(),
            EngineState::Unavailable { .. } => return Err(EngineError::Unavailable),
        };

        let prompt = build_prompt(question);
        let params = self.params.clone();
        let task_prompt = prompt.clone();

        let completion = task::spawn_blocking(move || generator.complete(&task_prompt, &params))
            .await
            .map_err(|err| EngineError::Generation(format!("inference task failed: {err}")))??;

        info!(
            prompt_tokens = completion.stats.prompt_tokens,
            generated_tokens = completion.stats.generated_tokens,
            elapsed_ms = completion.stats.total_time_ms as u64,
            tokens_per_second = completion.stats.tokens_per_second(),
            "answer generated"
        );

        Ok(strip_prompt(&completion.text, &prompt))
    }
}

#[cfg(feature = "tch-backend")]
fn load_generator(config: &AppConfig) -> Result<Arc<dyn TextGenerator>, EngineError> {
    let model = crate::model::QuantizedLoraModel::load(config)?;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "tch-backend"))]
fn load_generator(_config: &AppConfig) -> Result<Arc<dyn TextGenerator>, EngineError> {
    Err(EngineError::Load(
        "built without an inference backend; enable the `tch-backend` feature".into(),
    ))
}
