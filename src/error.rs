//! Error taxonomy and JSON error bodies for the bridge

use hyper::StatusCode;
use serde::Serialize;

/// Header carrying the error code on every error response
pub const X_BRIDGE_ERROR: &str = "x-bridge-error";

/// Fallback detail when a failed worker wrote nothing to stderr
pub const UNKNOWN_WORKER_ERROR: &str = "Unknown error occurred";

/// Error codes for bridge failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeErrorCode {
    /// No executable candidate could be launched
    StartFailure,
    /// Worker exited with a non-zero status
    WorkerFailure,
    /// Worker exited cleanly but stdout was not a single JSON document
    DecodeFailure,
    /// Worker did not exit before the deadline
    Timeout,
    /// Request body exceeded the configured limit
    RequestTooLarge,
    /// Request body could not be read
    InvalidRequest,
    /// Internal bridge error
    InternalError,
}

impl BridgeErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeErrorCode::StartFailure => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeErrorCode::WorkerFailure => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeErrorCode::DecodeFailure => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeErrorCode::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            BridgeErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            BridgeErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Bridge-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            BridgeErrorCode::StartFailure => "START_FAILURE",
            BridgeErrorCode::WorkerFailure => "WORKER_FAILURE",
            BridgeErrorCode::DecodeFailure => "DECODE_FAILURE",
            BridgeErrorCode::Timeout => "TIMEOUT",
            BridgeErrorCode::RequestTooLarge => "REQUEST_TOO_LARGE",
            BridgeErrorCode::InvalidRequest => "INVALID_REQUEST",
            BridgeErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: BridgeErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
    /// Underlying error text (start error, stderr, decode error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Raw worker output kept for diagnosis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: BridgeErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            detail: None,
            output: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Convert to a JSON value
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "code": self.code.as_header_value(),
                "message": self.message,
                "status": self.status,
            })
        })
    }
}
