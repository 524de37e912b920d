//! Error handling for Causeway Core.
//!
//! This module provides:
//! - A machine-readable [`ErrorCode`] taxonomy shared by every component
//! - HTTP status code mapping for API responses
//! - User-facing messages kept separate from internal detail
//! - Retryability classification used by the broker consumers
//! - Metrics and tracing integration on error emission

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Causeway operations.
pub type Result<T> = std::result::Result<T, CausewayError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation (1000-1099)
    ValidationError,
    UnknownModel,
    MissingRequiredField,
    InvalidFormat,

    // Authentication (1100-1199)
    Unauthenticated,
    InvalidToken,
    TokenExpired,

    // Records (2000-2099)
    RecordNotFound,
    DuplicateRecord,
    StatusConflict,

    // Infrastructure (3000-3099)
    BrokerUnavailable,
    StoreUnavailable,
    SerializationError,

    // Plugin execution (4000-4099)
    PluginExecutionFailed,
    PluginTimeout,

    // Configuration / internal (9000-9099)
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            // Validation
            Self::ValidationError => 1000,
            Self::UnknownModel => 1001,
            Self::MissingRequiredField => 1002,
            Self::InvalidFormat => 1003,

            // Authentication
            Self::Unauthenticated => 1100,
            Self::InvalidToken => 1101,
            Self::TokenExpired => 1102,

            // Records
            Self::RecordNotFound => 2000,
            Self::DuplicateRecord => 2001,
            Self::StatusConflict => 2002,

            // Infrastructure
            Self::BrokerUnavailable => 3000,
            Self::StoreUnavailable => 3001,
            Self::SerializationError => 3002,

            // Plugin execution
            Self::PluginExecutionFailed => 4000,
            Self::PluginTimeout => 4001,

            // Configuration / internal
            Self::ConfigurationError => 9000,
            Self::InternalError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            // Bad Request (400)
            Self::UnknownModel => StatusCode::BAD_REQUEST,

            // Unauthorized (401)
            Self::Unauthenticated | Self::InvalidToken | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }

            // Not Found (404)
            Self::RecordNotFound => StatusCode::NOT_FOUND,

            // Conflict (409)
            Self::DuplicateRecord | Self::StatusConflict => StatusCode::CONFLICT,

            // Unprocessable Entity (422)
            Self::ValidationError | Self::MissingRequiredField | Self::InvalidFormat => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            // Service Unavailable (503)
            Self::BrokerUnavailable | Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            // Internal Server Error (500)
            Self::SerializationError
            | Self::PluginExecutionFailed
            | Self::PluginTimeout
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a consumer should leave the message unacknowledged and let the
    /// broker redeliver. Only infrastructure-level failures qualify.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerUnavailable | Self::StoreUnavailable | Self::InternalError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_else(|_| "UNKNOWN".to_string());
        write!(f, "{}", s.trim_matches('"'))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Causeway Error
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for all Causeway operations.
///
/// Carries a stable [`ErrorCode`], a user-facing message, and optional
/// internal detail that is logged but never returned to clients.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CausewayError {
    code: ErrorCode,
    message: Cow<'static, str>,
    internal: Option<String>,
}

impl CausewayError {
    /// Create a new error with a user-facing message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            internal: None,
        }
    }

    /// Create a new error carrying internal detail for the logs.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            internal: Some(internal.into()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn unknown_model(name: &str) -> Self {
        Self::new(ErrorCode::UnknownModel, format!("Unknown model: {name}"))
    }

    pub fn unauthenticated(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn not_found(entity: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{entity} not found: {id}"),
        )
    }

    pub fn broker_unavailable(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::BrokerUnavailable,
            "Message broker is unavailable, retry later",
            detail,
        )
    }

    pub fn store_unavailable(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            "Storage backend is unavailable, retry later",
            detail,
        )
    }

    pub fn plugin_failed(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::with_internal(
            ErrorCode::PluginExecutionFailed,
            format!("Analysis execution failed: {detail}"),
            detail,
        )
    }

    pub fn plugin_timeout(secs: u64) -> Self {
        Self::new(
            ErrorCode::PluginTimeout,
            format!("Analysis execution exceeded the {secs}s timeout"),
        )
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            detail,
        )
    }

    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// The stable error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The user-facing message.
    pub fn user_message(&self) -> &str {
        &self.message
    }

    /// Internal detail, if any.
    pub fn internal_detail(&self) -> Option<&str> {
        self.internal.as_deref()
    }

    /// Whether the failed operation should be retried via broker redelivery.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for CausewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to serialize or deserialize data",
            err.to_string(),
        )
    }
}

impl From<sqlx::Error> for CausewayError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::new(ErrorCode::RecordNotFound, "Record not found"),
            _ => Self::store_unavailable(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for CausewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::broker_unavailable(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Response Mapping
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for CausewayError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();

        if status.is_server_error() {
            error!(
                code = %self.code,
                internal = self.internal.as_deref().unwrap_or(""),
                "{}", self.message
            );
        } else {
            warn!(code = %self.code, "{}", self.message);
        }

        counter!(
            "causeway_api_errors_total",
            "code" => self.code.to_string()
        )
        .increment(1);

        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });

        (status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
