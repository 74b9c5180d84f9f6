use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cloud_core::CloudError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<CloudError> for ApiError {
    fn from(err: CloudError) -> Self {
        let message = err.to_string();
        match err {
            CloudError::NotFound(_) => ApiError::NotFound(message),
            CloudError::AlreadyExists(_) | CloudError::Conflict(_) => ApiError::Conflict(message),
            CloudError::Unavailable(_) => ApiError::Unavailable(message),
            CloudError::Failed(_) => ApiError::Internal(message),
        }
    }
}
