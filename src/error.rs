use std::collections::BTreeMap;
use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Field-level validation failures, keyed by request field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: &str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// `Ok(())` when nothing was collected, otherwise `AppError::Validation`.
    pub fn into_result(self) -> AppResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(field, messages)| format!("{}: {}", field, messages.join(", ")))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(FieldErrors),

    #[error("Unsupported email provider: {0}")]
    UnsupportedProvider(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Delivery failed for notification {id}: {message}")]
    Delivery { id: i64, message: String },

    #[error("Job {0} is already scheduled")]
    AlreadyScheduled(i64),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid push credentials: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl AppError {
    /// Structured details attached to the error body, when the variant carries any.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Validation(fields) => serde_json::to_value(fields).ok(),
            AppError::Delivery { id, .. } => Some(serde_json::json!({ "id": id, "status": "failed" })),
            AppError::AlreadyScheduled(id) => Some(serde_json::json!({ "id": id })),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Validation(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                self.to_string(),
            ),
            AppError::UnsupportedProvider(_) => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_PROVIDER",
                self.to_string(),
            ),
            AppError::MissingCredential(_) => (
                StatusCode::BAD_REQUEST,
                "MISSING_CREDENTIAL",
                self.to_string(),
            ),
            AppError::Delivery { id, message } => {
                tracing::warn!("Delivery failed for notification {}: {}", id, message);
                (StatusCode::BAD_GATEWAY, "DELIVERY_ERROR", message.clone())
            }
            AppError::AlreadyScheduled(_) => {
                (StatusCode::CONFLICT, "ALREADY_SCHEDULED", self.to_string())
            }
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                self.to_string(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Jwt(e) => {
                tracing::warn!("Push credential error: {:?}", e);
                (
                    StatusCode::BAD_REQUEST,
                    "INVALID_PUSH_CREDENTIALS",
                    "Push credentials could not be loaded".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "Server configuration error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: self.details(),
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_display_groups_messages_per_field() {
        let mut errors = FieldErrors::new();
        errors.add("subject", "must not be empty");
        errors.add("delivery_time", "must be in the future");
        errors.add("subject", "must be at most 255 characters");

        assert_eq!(
            errors.to_string(),
            "delivery_time: must be in the future; subject: must not be empty, must be at most 255 characters"
        );
        assert!(errors.contains("subject"));
        assert!(!errors.contains("message"));
    }

    #[test]
    fn empty_field_errors_is_ok() {
        assert!(FieldErrors::new().into_result().is_ok());
        match FieldErrors::single("message", "required").into_result() {
            Err(AppError::Validation(fields)) => assert!(fields.contains("message")),
            other => panic!("expected Validation, got: {:?}", other),
        }
    }

    #[test]
    fn error_statuses() {
        let cases = [
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                AppError::UnsupportedProvider("Acme".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::MissingCredential("api_secret".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Delivery {
                    id: 1,
                    message: "boom".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (AppError::AlreadyScheduled(3), StatusCode::CONFLICT),
            (
                AppError::Validation(FieldErrors::single("subject", "required")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
