pub mod adapter;
pub mod config;
pub mod error;
pub mod model;
pub mod quantization;
pub mod sampling;
pub mod server;
pub mod setup;

pub use config::AppConfig;
pub use error::{ApiError, EngineError};
pub use model::{GenerationParams, LegalAssistant, TextGenerator};
pub use server::build_router;
pub use setup::{SetupReport, run_checks};
