//! API Response types and error codes
//!
//! - `ApiResponse<T>`: Unified response wrapper
//! - `ApiError`: Error side of every handler, rendered with the same envelope
//! - `error_codes`: Standard error code constants

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::ledger::LedgerError;
use crate::transfer::TransferError;

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error_codes::NOT_FOUND, msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SERVICE_UNAVAILABLE,
            msg,
        )
    }

    pub fn into_err<T>(self) -> ApiResult<T> {
        Err(self)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "Request failed: {}", self.msg);
        }
        (self.status, Json(ApiResponse::<()>::error(self.code, self.msg))).into_response()
    }
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self::new(
            status_from(e.http_status()),
            error_codes::for_name(e.code()),
            e.to_string(),
        )
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        Self::new(
            status_from(e.http_status()),
            error_codes::for_name(e.code()),
            e.to_string(),
        )
    }
}

/// Standard API error codes
pub mod error_codes {
    // Success
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const MISSING_IDEMPOTENCY_KEY: i32 = 1002;

    // Business rule violations (2xxx)
    pub const INSUFFICIENT_BALANCE: i32 = 2001;
    pub const DAILY_LIMIT_EXCEEDED: i32 = 2002;
    pub const ACCOUNT_NOT_ACTIVE: i32 = 2003;
    pub const CURRENCY_MISMATCH: i32 = 2004;
    pub const BALANCE_OUT_OF_RANGE: i32 = 2005;

    // Conflicts (3xxx)
    pub const IDEMPOTENCY_KEY_REUSE: i32 = 3001;
    pub const TRANSFER_IN_PROGRESS: i32 = 3002;
    pub const CONCURRENT_MODIFICATION: i32 = 3003;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4000;
    pub const ACCOUNT_NOT_FOUND: i32 = 4001;
    pub const TRANSFER_NOT_FOUND: i32 = 4002;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;

    /// Numeric code for a domain error name
    pub fn for_name(name: &str) -> i32 {
        match name {
            "VALIDATION_ERROR" => INVALID_PARAMETER,
            "INSUFFICIENT_BALANCE" => INSUFFICIENT_BALANCE,
            "DAILY_LIMIT_EXCEEDED" => DAILY_LIMIT_EXCEEDED,
            "ACCOUNT_NOT_ACTIVE" => ACCOUNT_NOT_ACTIVE,
            "CURRENCY_MISMATCH" => CURRENCY_MISMATCH,
            "BALANCE_OUT_OF_RANGE" => BALANCE_OUT_OF_RANGE,
            "IDEMPOTENCY_KEY_REUSE" => IDEMPOTENCY_KEY_REUSE,
            "TRANSFER_IN_PROGRESS" => TRANSFER_IN_PROGRESS,
            "CONCURRENT_MODIFICATION" => CONCURRENT_MODIFICATION,
            "ACCOUNT_NOT_FOUND" => ACCOUNT_NOT_FOUND,
            "TRANSFER_NOT_FOUND" => TRANSFER_NOT_FOUND,
            "LOCK_UNAVAILABLE" => SERVICE_UNAVAILABLE,
            _ => INTERNAL_ERROR,
        }
    }
}
