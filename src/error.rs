use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("quantization error: {0}")]
    Quantization(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::ModelNotLoaded
            | ServiceError::Tokenizer(_)
            | ServiceError::Inference(_)
            | ServiceError::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Adapter(_) | ServiceError::Quantization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(feature = "tch-backend")]
impl From<tch::TchError> for ServiceError {
    fn from(err: tch::TchError) -> Self {
        ServiceError::Inference(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
            "success": false,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_bad_request() {
        let err = ServiceError::BadRequest("prompt must not be empty".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "invalid request: prompt must not be empty");
    }

    #[test]
    fn unloaded_model_is_a_server_error() {
        assert_eq!(
            ServiceError::ModelNotLoaded.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn precision_failures_name_the_stage() {
        let err = ServiceError::Quantization("failed to cast base model to bf16".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().starts_with("quantization error:"));
    }
}
