//! Account handlers (open, read, deposit, withdraw)

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::response::{ApiError, ApiResult, ok};
use super::state::AppState;
use crate::ledger::{Account, AccountStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub customer_id: String,
    pub initial_amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AmountQuery {
    pub amount: Decimal,
    pub currency: String,
}

/// Account as returned by the API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: i64,
    pub customer_id: String,
    pub balance: Decimal,
    pub currency: String,
    pub status: AccountStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Account> for AccountView {
    fn from(a: Account) -> Self {
        Self {
            id: a.id,
            customer_id: a.customer_id,
            balance: a.balance,
            currency: a.currency,
            status: a.status,
            daily_limit: a.daily_limit,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

/// POST /api/v1/accounts
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateAccountRequest>, JsonRejection>,
) -> ApiResult<AccountView> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if req.customer_id.trim().is_empty() {
        return ApiError::bad_request("Customer ID is required").into_err();
    }
    let currency = req
        .currency
        .as_deref()
        .unwrap_or(state.default_currency.as_str());

    let account = state
        .ledger
        .create_account(&req.customer_id, req.initial_amount, currency)
        .await?;
    ok(account.into())
}

/// GET /api/v1/accounts/{id}
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AccountView> {
    let account = state.ledger.find_account(&id).await?;
    ok(account.into())
}

/// POST /api/v1/accounts/{id}/add?amount=&currency=
pub async fn add_money(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<AmountQuery>, QueryRejection>,
) -> ApiResult<AccountView> {
    let Query(q) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let account = state.ledger.credit(&id, q.amount, &q.currency).await?;
    ok(account.into())
}

/// POST /api/v1/accounts/{id}/withdraw?amount=&currency=
pub async fn withdraw_money(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<AmountQuery>, QueryRejection>,
) -> ApiResult<AccountView> {
    let Query(q) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let account = state.ledger.debit(&id, q.amount, &q.currency).await?;
    ok(account.into())
}
