//! HTTP API for the account and transfer services

pub mod accounts;
pub mod response;
pub mod state;
pub mod transfers;

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde::Serialize;

pub use response::{ApiError, ApiResponse, ApiResult, error_codes, ok};
pub use state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    let database = match &state.pg_db {
        Some(db) => {
            if let Err(e) = db.health_check().await {
                tracing::error!("[HEALTH] PostgreSQL ping failed: {}", e);
                return ApiError::service_unavailable("Database unreachable").into_err();
            }
            "postgres"
        }
        None => "memory",
    };
    ok(HealthResponse {
        status: "UP",
        database,
    })
}

async fn fallback() -> ApiError {
    ApiError::not_found("No such route")
}

pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let account_routes = Router::new()
        .route("/", post(accounts::create_account))
        .route("/{id}", get(accounts::get_account))
        .route("/{id}/add", post(accounts::add_money))
        .route("/{id}/withdraw", post(accounts::withdraw_money));

    let transfer_routes = Router::new()
        .route("/", post(transfers::initiate_transfer))
        .route("/{transaction_id}", get(transfers::get_transfer));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1/accounts", account_routes)
        .nest("/api/v1/transfers", transfer_routes)
        .fallback(fallback)
        .with_state(state)
}
