//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::amount;
use crate::db::Deposit;

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "SIGNATURE_MISMATCH",
///         "message": "Signature mismatch: signed by 0x..., claimed by 0x..."
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Error code (e.g., "INSUFFICIENT_BALANCE").
    pub code: String,

    /// Human-readable error message.
    pub message: String,
}

/// Participation threshold.
///
/// Returned by `GET /operator/threshold`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdResponse {
    pub threshold: usize,
}

/// Number of fillable deposits.
///
/// Returned by `GET /operator/quorum`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuorumResponse {
    pub quorum: usize,

    #[serde(with = "amount")]
    pub minimum_amount: u128,
}

/// Fillable deposits.
///
/// Returned by `GET /operator/deposits`
///
/// ## Example Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "deposits": [
///             {
///                 "id": 1,
///                 "sender": "0x1f0a...",
///                 "amount": "10000000000000000",
///                 "pubKey": "0x04d5...",
///                 "encRecipient": "0xa1b2...",
///                 "signature": "0x5e1c...",
///                 "dealId": null,
///                 "createdAt": "2024-01-15T12:00:00Z"
///             }
///         ],
///         "minimumAmount": "0"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillableDepositsResponse {
    pub deposits: Vec<Deposit>,

    #[serde(with = "amount")]
    pub minimum_amount: u128,
}

/// Accepted deposit and the quorum after it.
///
/// Returned by `POST /operator/deposits`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDepositResponse {
    pub deposit: Deposit,
    pub quorum: usize,
}

/// Health check response.
///
/// Returned by `GET /health`
///
/// ## Example Response
///
/// ```json
/// {
///     "success": true,
///     "data": {
///         "status": "healthy",
///         "store": true,
///         "ledgerRpc": true,
///         "active": true,
///         "blockCountdown": 3,
///         "connections": 2,
///         "version": "0.1.0",
///         "timestamp": "2024-01-15T12:00:00Z"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service status: "healthy" or "unhealthy".
    pub status: String,

    /// Ledger store status.
    pub store: bool,

    /// Public ledger RPC status.
    pub ledger_rpc: bool,

    /// Whether the operator accepts deposits.
    pub active: bool,

    /// Last countdown computed by the settlement loop.
    pub block_countdown: Option<i64>,

    /// Open WebSocket connections.
    pub connections: usize,

    /// Service version.
    pub version: String,

    /// Current timestamp.
    pub timestamp: DateTime<Utc>,
}
