//! HTTP error mapping.
//!
//! Internal error kinds translate to statuses at this boundary: NotFound
//! becomes 404, terminal tasks 410, optimistic conflicts 409, validation
//! 400, an unconfigured token issuer 503, and anything else a generic 500.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use shepherd_core::completion::CompletionError;
use shepherd_core::token::TokenError;
use shepherd_store::StoreError;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn gone(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GONE,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        // Detail goes to the log, not the wire.
        tracing::error!(error = %err, "internal error serving request");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::not_found(err.to_string()),
            StoreError::Conflict { .. } => Self::conflict(err.to_string()),
            other => Self::internal(other),
        }
    }
}

impl From<CompletionError> for ApiError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::NotFound(id) => Self::not_found(format!("task {id} not found")),
            CompletionError::Contended(id) => {
                Self::conflict(format!("task {id} is contended, retry"))
            }
            CompletionError::Store(e) => e.into(),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Unavailable => Self::unavailable(err.to_string()),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
