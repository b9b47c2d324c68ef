mod engine;
mod generator;
#[cfg(feature = "tch-backend")]
mod loader;
mod types;

pub use engine::{LegalAssistant, build_prompt, strip_prompt};
pub use generator::{TextGenerator, decode_tokens};
#[cfg(feature = "tch-backend")]
pub use loader::QuantizedLoraModel;
pub use types::{AdapterMetadata, Completion, GenerationParams, GenerationStats, ModelMetadata};
