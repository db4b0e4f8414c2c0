use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use warden_core::{ErrorKind, WardenError};

/// JSON error reply of the intake API.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        let status = match err.kind() {
            ErrorKind::InvalidEvent => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
