//! API error types and handling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use custody_core::Error as CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// API error response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Additional details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Venue error: {0}")]
    Venue(custody_core::VenueError),

    #[error("Confirmation pending for transaction {0}; check the ledger")]
    ConfirmationPending(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Precondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Venue(_) => StatusCode::BAD_GATEWAY,
            ApiError::ConfirmationPending(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Precondition(_) => "PRECONDITION_FAILED",
            ApiError::Venue(_) => "VENUE_ERROR",
            ApiError::ConfirmationPending(_) => "CONFIRMATION_PENDING",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(what) => ApiError::NotFound(what),
            CoreError::Precondition { message } => ApiError::Precondition(message),
            CoreError::SignerRejected => {
                ApiError::Conflict("signature request rejected by signer".to_string())
            }
            CoreError::Venue(venue) => ApiError::Venue(venue),
            CoreError::ConfirmationAmbiguous { tx_signature } => {
                ApiError::ConfirmationPending(tx_signature)
            }
            CoreError::LegacyState { address } => ApiError::Conflict(format!(
                "legacy custody scheme: funds held in uncontrolled address {address}"
            )),
            CoreError::OperationInFlight { operation_id } => ApiError::Conflict(format!(
                "operation {operation_id} already in flight for this target"
            )),
            CoreError::SnapshotStale { message } => ApiError::ServiceUnavailable(message),
            CoreError::Database(e) => ApiError::Database(e),
            CoreError::Json(e) => ApiError::Serialization(e),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Log 500 errors for debugging (these indicate bugs or infrastructure issues)
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                error_code = self.error_code(),
                error = %self,
                "Internal server error"
            );
        }

        let body = match &self {
            // Venue errors carry the typed classification as a UX hint
            // alongside the verbatim message.
            ApiError::Venue(venue) => ErrorResponse::new(self.error_code(), &venue.message)
                .with_details(serde_json::json!({
                    "kind": venue.kind,
                    "hint": venue.kind.hint(),
                    "retryable": venue.is_retryable(),
                })),
            _ => ErrorResponse::new(self.error_code(), self.to_string()),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
