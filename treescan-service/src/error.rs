use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use treescan_core::{ErrorEnvelope, ScanError};

pub struct AppError {
    pub status: StatusCode,
    pub body: ErrorEnvelope,
}

impl AppError {
    pub fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorEnvelope::new(
                "not_found",
                format!("{} not found", what),
                "Check the ID and try again",
            ),
        }
    }

    pub fn bad_request(code: &str, message: impl Into<String>, hint: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorEnvelope::new(code, message, hint),
        }
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorEnvelope::internal(&msg.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}

impl From<ScanError> for AppError {
    fn from(err: ScanError) -> Self {
        let status = match &err {
            ScanError::ScanNotFound(_) | ScanError::BlobNotFound(_) => StatusCode::NOT_FOUND,
            ScanError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
            ScanError::Clone { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: err.envelope(),
        }
    }
}
