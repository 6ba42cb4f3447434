//! JSON error responses

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::Error;

/// An error rendered as `{"error": {"code", "message"}}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'static str,
    message: &'a str,
}

impl ApiError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            Error::ProviderNotFound(_) => (StatusCode::BAD_REQUEST, "provider_not_found"),
            Error::Upstream { .. } | Error::Auth(_) | Error::EmptySummary | Error::Http(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
            Error::Cancelled | Error::ClientDisconnected => {
                (StatusCode::SERVICE_UNAVAILABLE, "cancelled")
            }
            Error::Config(_)
            | Error::Database(_)
            | Error::Sqlite(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Toml(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }

        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
