use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures surfaced by the inference engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("error processing request: {0}")]
    Generation(String),
    #[error("model not loaded")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("{0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable => ApiError::ModelNotLoaded,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
            ApiError::ModelNotLoaded => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "error": "TinyLlama model not loaded",
                    "message": "Please ensure the model files are available and try again",
                }),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": msg }),
            ),
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_http_statuses() {
        let unavailable = ApiError::from(EngineError::Unavailable).into_response();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let load = ApiError::from(EngineError::Load("no such file".into()));
        assert!(matches!(load, ApiError::Internal(ref msg) if msg.contains("no such file")));
        assert_eq!(load.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);

        let generation = ApiError::from(EngineError::Generation("oom".into())).into_response();
        assert_eq!(generation.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
