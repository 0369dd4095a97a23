//! Transfer handlers

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use uuid::Uuid;

use super::response::{ApiError, ApiResult, error_codes, ok};
use super::state::AppState;
use crate::transfer::{TransferDetails, TransferRequest, TransferResponse};

pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// POST /api/v1/transfers
pub async fn initiate_transfer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<TransferRequest>, JsonRejection>,
) -> ApiResult<TransferResponse> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                axum::http::StatusCode::BAD_REQUEST,
                error_codes::MISSING_IDEMPOTENCY_KEY,
                format!("Missing {} header", IDEMPOTENCY_KEY_HEADER),
            )
        })?;
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    tracing::info!(idempotency_key = %key, "Transfer request received");
    let response = state.transfers.initiate(key, &req).await?;
    ok(response)
}

/// GET /api/v1/transfers/{transactionId}
pub async fn get_transfer(
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
) -> ApiResult<TransferDetails> {
    let id = Uuid::parse_str(transaction_id.trim())
        .map_err(|_| ApiError::bad_request(format!("Invalid transaction id: {}", transaction_id)))?;
    let transfer = state.transfers.get(id).await?;
    ok(transfer.into())
}
