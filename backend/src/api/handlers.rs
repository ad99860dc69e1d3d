//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Extracts request data
//! 2. Validates input
//! 3. Calls the operator coordinator
//! 4. Returns a formatted response
//!
//! ## Error Handling
//!
//! All errors are caught and returned as JSON:
//!
//! ```json
//! {
//!     "success": false,
//!     "error": {
//!         "code": "INSUFFICIENT_BALANCE",
//!         "message": "Insufficient balance for 0x1f0a...: required 10, available 4"
//!     }
//! }
//! ```

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::db::{DealStatus, StoreError};
use crate::models::{
    ApiResponse, DealQuery, FillableDepositsResponse, FillableQuery, HealthResponse, QuorumResponse,
    SubmitDepositRequest, SubmitDepositResponse, ThresholdResponse,
};
use crate::services::signature::SignatureError;
use crate::services::{DealError, OperatorError};
use crate::AppState;

/// Map an operator error to an error code and HTTP status.
pub fn error_status(err: &OperatorError) -> (&'static str, StatusCode) {
    match err {
        OperatorError::OperatorNotReady => ("OPERATOR_NOT_READY", StatusCode::SERVICE_UNAVAILABLE),
        OperatorError::InvalidDeposit(_) => ("INVALID_DEPOSIT", StatusCode::BAD_REQUEST),
        OperatorError::Signature(SignatureError::InvalidSignatureEncoding(_)) => {
            ("INVALID_SIGNATURE_ENCODING", StatusCode::BAD_REQUEST)
        }
        OperatorError::Signature(SignatureError::SignatureMismatch { .. }) => {
            ("SIGNATURE_MISMATCH", StatusCode::BAD_REQUEST)
        }
        OperatorError::Deal(DealError::InsufficientBalance { .. }) => {
            ("INSUFFICIENT_BALANCE", StatusCode::BAD_REQUEST)
        }
        OperatorError::Deal(DealError::Store(StoreError::DuplicateUnassignedDeposit(_)))
        | OperatorError::Store(StoreError::DuplicateUnassignedDeposit(_)) => {
            ("DUPLICATE_DEPOSIT", StatusCode::CONFLICT)
        }
        _ => ("INTERNAL_ERROR", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

fn error_response(context: &str, err: OperatorError) -> HttpResponse {
    let (code, status) = error_status(&err);
    if status.is_server_error() {
        error!("{} failed: {}", context, err);
    } else {
        warn!("{} rejected: {}", context, err);
    }
    HttpResponse::build(status).json(ApiResponse::<()>::error(code, &err.to_string()))
}

/// API information endpoint (root).
///
/// ## Endpoint
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Salad Operator API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "config": "GET /operator/config",
            "threshold": "GET /operator/threshold",
            "quorum": "GET /operator/quorum?minimumAmount=",
            "fillableDeposits": "GET /operator/deposits?minimumAmount=",
            "submitDeposit": "POST /operator/deposits",
            "deals": "GET /operator/deals?status=",
            "websocket": "GET /ws/{clientId}"
        }
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// Checks the store, the public ledger RPC and whether the operator
/// accepts deposits.
///
/// ## Endpoint
///
/// `GET /health`
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let store_healthy = state.store.get_last_mix_block().await.is_ok();
    let ledger_healthy = state.ledger.block_number().await.is_ok();
    let active = state.coordinator.is_active().await;

    let overall_healthy = store_healthy && ledger_healthy;

    let response = HealthResponse {
        status: if overall_healthy { "healthy" } else { "unhealthy" }.to_string(),
        store: store_healthy,
        ledger_rpc: ledger_healthy,
        active,
        block_countdown: state.coordinator.last_countdown().await,
        connections: state.ws_registry.total_connections().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    let status_code = if overall_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    HttpResponse::build(status_code).json(ApiResponse::success(response))
}

/// Contract addresses and the encryption public key bundle.
///
/// ## Endpoint
///
/// `GET /operator/config`
pub async fn get_config(state: web::Data<Arc<AppState>>) -> HttpResponse {
    match state.coordinator.fetch_config().await {
        Ok(config) => HttpResponse::Ok().json(ApiResponse::success(config)),
        Err(e) => error_response("Fetch config", e),
    }
}

/// Number of deposits needed to form a deal.
///
/// ## Endpoint
///
/// `GET /operator/threshold`
pub async fn get_threshold(state: web::Data<Arc<AppState>>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(ThresholdResponse {
        threshold: state.coordinator.get_threshold(),
    }))
}

/// Number of fillable deposits.
///
/// ## Endpoint
///
/// `GET /operator/quorum?minimumAmount=<amount>`
pub async fn get_quorum(state: web::Data<Arc<AppState>>, query: web::Query<FillableQuery>) -> HttpResponse {
    let minimum_amount = query.minimum_amount;
    match state.coordinator.get_quorum(minimum_amount).await {
        Ok(quorum) => HttpResponse::Ok().json(ApiResponse::success(QuorumResponse {
            quorum,
            minimum_amount,
        })),
        Err(e) => error_response("Get quorum", e),
    }
}

/// Fillable deposits.
///
/// ## Endpoint
///
/// `GET /operator/deposits?minimumAmount=<amount>`
pub async fn get_fillable_deposits(
    state: web::Data<Arc<AppState>>,
    query: web::Query<FillableQuery>,
) -> HttpResponse {
    let minimum_amount = query.minimum_amount;
    match state.coordinator.fetch_fillable_deposits(minimum_amount).await {
        Ok(deposits) => HttpResponse::Ok().json(ApiResponse::success(FillableDepositsResponse {
            deposits,
            minimum_amount,
        })),
        Err(e) => error_response("Fetch fillable deposits", e),
    }
}

/// Submit signed deposit metadata.
///
/// The signature must recover to `sender` and the sender's on-ledger
/// balance must cover `amount`. A sender can hold one unassigned deposit
/// at a time.
///
/// ## Endpoint
///
/// `POST /operator/deposits`
///
/// ## Example
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/operator/deposits \
///   -H "Content-Type: application/json" \
///   -d '{
///     "sender": "0x1f0a...",
///     "amount": "10000000000000000",
///     "pubKey": "0x04d5...",
///     "encRecipient": "0xa1b2...",
///     "signature": "0x5e1c...1b"
///   }'
/// ```
pub async fn submit_deposit(
    state: web::Data<Arc<AppState>>,
    body: web::Json<SubmitDepositRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    info!("Deposit submission from {} (amount {})", request.sender, request.amount);

    let deposit = match state.coordinator.submit_deposit_metadata(request.into()).await {
        Ok(deposit) => deposit,
        Err(e) => return error_response("Deposit submission", e),
    };

    match state.coordinator.get_quorum(0).await {
        Ok(quorum) => HttpResponse::Created().json(ApiResponse::success(SubmitDepositResponse { deposit, quorum })),
        Err(e) => error_response("Get quorum", e),
    }
}

/// Deals, newest last.
///
/// ## Endpoint
///
/// `GET /operator/deals?status=<created|executing|executed|failed>`
pub async fn get_deals(state: web::Data<Arc<AppState>>, query: web::Query<DealQuery>) -> HttpResponse {
    let status = match query.status.as_deref().map(str::parse::<DealStatus>).transpose() {
        Ok(status) => status,
        Err(e) => {
            return HttpResponse::BadRequest().json(ApiResponse::<()>::error("INVALID_STATUS", &e.to_string()));
        }
    };

    match state.coordinator.fetch_deals(status).await {
        Ok(deals) => HttpResponse::Ok().json(ApiResponse::success(deals)),
        Err(e) => error_response("Fetch deals", e),
    }
}
