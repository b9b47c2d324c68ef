use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ApiError,
    model::{LegalAssistant, ModelMetadata},
};

pub const API_NAME: &str = "TinyLlama QLoRA Legal AI API";

pub const SAMPLE_QUESTIONS: [&str; 10] = [
    "What is Section 420 of IPC?",
    "Explain fundamental rights in Indian Constitution",
    "What are essential elements of a valid contract?",
    "How does consumer protection work in India?",
    "What is Corporate Social Responsibility?",
    "What are grounds for divorce under Hindu Marriage Act?",
    "Explain the Transfer of Property Act",
    "What is the Limitation Act 1963?",
    "How does Insolvency and Bankruptcy Code work?",
    "What are the punishments for murder under IPC?",
];

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub assistant: Arc<LegalAssistant>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub question: String,
    pub answer: String,
    pub status: &'static str,
}

#[derive(Serialize)]
struct SampleQuestionsResponse {
    questions: &'static [&'static str],
}

#[derive(Serialize)]
struct Endpoints {
    health: &'static str,
    chat: &'static str,
    sample_questions: &'static str,
    info: &'static str,
}

#[derive(Serialize)]
struct InfoResponse {
    name: &'static str,
    version: &'static str,
    status: &'static str,
    base_model: String,
    endpoints: Endpoints,
    model: Option<ModelMetadata>,
    load_error: Option<String>,
}

pub fn build_router(config: Arc<AppConfig>, assistant: Arc<LegalAssistant>) -> Router {
    let state = AppState { config, assistant };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/sample-questions", get(sample_questions))
        .route("/api/info", get(api_info))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let response = if state.assistant.is_ready() {
        HealthResponse {
            status: "healthy",
            message: "QLoRA Legal AI API is running",
        }
    } else {
        HealthResponse {
            status: "model_not_loaded",
            message: "AI model not loaded",
        }
    };
    Json(response)
}

/// Extracts the trimmed question from a raw chat body.
///
/// The body is parsed by hand so that every malformed request maps to a 400
/// with a JSON error rather than the extractor's own rejection.
pub fn parse_question(body: &[u8]) -> Result<String, ApiError> {
    let no_json = || ApiError::BadRequest("No JSON data provided".into());

    let payload: Value = serde_json::from_slice(body).map_err(|_| no_json())?;
    let fields = match payload.as_object() {
        Some(fields) if !fields.is_empty() => fields,
        _ => return Err(no_json()),
    };

    let question = match fields.get("question") {
        None | Some(Value::Null) => "",
        Some(Value::String(question)) => question.trim(),
        Some(_) => {
            return Err(ApiError::BadRequest(
                "Field 'question' must be a string".into(),
            ));
        }
    };

    if question.is_empty() {
        return Err(ApiError::BadRequest("No question provided".into()));
    }
    Ok(question.to_string())
}

async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Json<ChatResponse>, ApiError> {
    let question = parse_question(&body)?;
    if !state.assistant.is_ready() {
        return Err(ApiError::ModelNotLoaded);
    }

    info!(chars = question.len(), "answering question");
    let answer = state.assistant.generate_answer(&question).await?;

    Ok(Json(ChatResponse {
        question,
        answer,
        status: "success",
    }))
}

async fn sample_questions() -> Json<SampleQuestionsResponse> {
    Json(SampleQuestionsResponse {
        questions: &SAMPLE_QUESTIONS,
    })
}

async fn api_info(State(state): State<AppState>) -> Json<InfoResponse> {
    let status = if state.assistant.is_ready() {
        "running"
    } else {
        "model_not_loaded"
    };

    Json(InfoResponse {
        name: API_NAME,
        version: env!("CARGO_PKG_VERSION"),
        status,
        base_model: state.config.base_model_id.clone(),
        endpoints: Endpoints {
            health: "/api/health",
            chat: "/api/chat",
            sample_questions: "/api/sample-questions",
            info: "/api/info",
        },
        model: state.assistant.metadata(),
        load_error: state.assistant.load_error().map(str::to_string),
    })
}
