//! # API Request Models
//!
//! Structures for incoming request bodies and query strings. The same
//! structures are used for WebSocket action payloads.

use serde::{Deserialize, Serialize};

use crate::db::models::amount;
use crate::db::NewDeposit;

/// Signed deposit metadata.
///
/// Body of `POST /operator/deposits` and payload of the
/// `submit_deposit_metadata` action.
///
/// ## Example JSON
///
/// ```json
/// {
///     "sender": "0x1f0a...",
///     "amount": "10000000000000000",
///     "pubKey": "0x04d5e6...",
///     "encRecipient": "0xa1b2c3...",
///     "signature": "0x5e1c...1b"
/// }
/// ```
///
/// `amount` is in the smallest unit; a string or a number is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitDepositRequest {
    /// Depositor account.
    pub sender: String,

    #[serde(with = "amount")]
    pub amount: u128,

    /// Depositor's ephemeral public key (hex).
    pub pub_key: String,

    /// Recipient encrypted for the confidential network (hex).
    pub enc_recipient: String,

    /// Typed-data signature over the four fields above (hex).
    pub signature: String,
}

impl From<SubmitDepositRequest> for NewDeposit {
    fn from(request: SubmitDepositRequest) -> Self {
        NewDeposit {
            sender: request.sender,
            amount: request.amount,
            pub_key: request.pub_key,
            enc_recipient: request.enc_recipient,
            signature: request.signature,
        }
    }
}

/// Minimum deposit amount filter.
///
/// Query of `GET /operator/deposits` and `GET /operator/quorum`, payload
/// of `fetch_fillable_deposits`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillableQuery {
    #[serde(default, with = "amount")]
    pub minimum_amount: u128,
}

/// Query parameters for deal listing.
#[derive(Debug, Clone, Deserialize)]
pub struct DealQuery {
    /// Filter by status (created, executing, executed, failed).
    pub status: Option<String>,
}
