//! # Database Models
//!
//! This module defines the data structures that map to database tables.
//! Each struct represents a row in a table.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `deposits` | Signed deposit metadata and its deal assignment |
//! | `deals` | Deals created on the public ledger |
//! | `cache` | Singleton key/value entries (public key bundle, last mix block, deployment) |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌──────────────────┐       ┌─────────────┐
//! │    deposits      │>──────│    deals    │
//! │                  │       │             │
//! │ id (PK)          │       │ deal_id (PK)│
//! │ sender           │       │ status      │
//! │ amount           │       │ participants│
//! │ deal_id (NULL =  │       │ tx_hash     │
//! │   fillable)      │       │ task_id     │
//! └──────────────────┘       └─────────────┘
//!
//! ┌──────────────────┐
//! │      cache       │
//! │ key (PK) │ value │
//! └──────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value written into `deposits.deal_id` when a deposit is discarded.
///
/// It can never collide with a real deal id, which is a `0x`-prefixed
/// 32-byte hash.
pub const DISCARDED_DEAL_ID: &str = "discarded";

/// Cache key of the encryption public key bundle.
pub const CACHE_KEY_PUB_KEY_DATA: &str = "pubKeyData";

/// Cache key of the last block at which a deal was attempted.
pub const CACHE_KEY_LAST_MIX_BLOCK: &str = "lastMixBlock";

/// Cache key of the contract deployment addresses.
pub const CACHE_KEY_DEPLOYMENT: &str = "deployment";

/// Deposit metadata as submitted by a depositor, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeposit {
    pub sender: String,
    pub amount: u128,
    pub pub_key: String,
    pub enc_recipient: String,
    pub signature: String,
}

/// Represents a deposit record in the database.
///
/// ## Fields
///
/// | Field | Type | Description |
/// |-------|------|-------------|
/// | id | i64 | Insertion sequence, defines fillable order |
/// | sender | String | Depositor account (lowercase hex) |
/// | amount | u128 | Deposit amount in the smallest unit |
/// | pub_key | String | Depositor's ephemeral public key (hex) |
/// | enc_recipient | String | Encrypted recipient address (hex) |
/// | signature | String | Typed-data signature over the payload (hex) |
/// | deal_id | `Option<String>` | `None` while fillable |
///
/// A deposit is never deleted and never modified once `deal_id` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub id: i64,
    pub sender: String,
    #[serde(with = "amount")]
    pub amount: u128,
    pub pub_key: String,
    pub enc_recipient: String,
    pub signature: String,
    pub deal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Deposit {
    /// Whether this deposit can still be assigned to a deal.
    pub fn is_fillable(&self) -> bool {
        self.deal_id.is_none()
    }
}

/// Deal status.
///
/// ```text
/// Created ──(task submitted)──> Executing ──(task confirmed)──> Executed
///    │
///    └──(assignment lost the race)──> Failed
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DealStatus {
    /// Deposits assigned; ledger transaction pending or recorded in `tx_hash`.
    Created,
    /// The execute-deal task was submitted to the confidential network.
    Executing,
    /// The execute-deal task was confirmed.
    Executed,
    /// No deposit references this deal.
    Failed,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Created => "created",
            DealStatus::Executing => "executing",
            DealStatus::Executed => "executed",
            DealStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DealStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(DealStatus::Created),
            "executing" => Ok(DealStatus::Executing),
            "executed" => Ok(DealStatus::Executed),
            "failed" => Ok(DealStatus::Failed),
            other => Err(format!("Unknown deal status: {}", other)),
        }
    }
}

/// Represents a deal record in the database.
///
/// ## Example
///
/// ```text
/// Deal {
///     deal_id: "0x5e1c...",
///     deposit_amount: 10_000_000_000_000_000,
///     participants: ["0x1f0a...", "0x9b3c..."],
///     nonce: 14,
///     status: Executing,
///     tx_hash: Some("0xa4d1..."),
///     task_id: Some("0x77be..."),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    /// Keccak-256 deal identifier (`0x` hex).
    pub deal_id: String,

    /// Amount of each participating deposit.
    #[serde(with = "amount")]
    pub deposit_amount: u128,

    /// Participant accounts in deposit insertion order.
    pub participants: Vec<String>,

    /// Operator ledger nonce used in the deal id derivation.
    pub nonce: u64,

    pub status: DealStatus,

    /// Hash of the `newDeal` ledger transaction, once sent.
    pub tx_hash: Option<String>,

    /// Confidential task that executed the deal.
    pub task_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The confidential network's encryption public key, as disclosed by a
/// `get_pub_key()` task.
///
/// The bundle carries everything a client needs to decrypt and check the
/// disclosure itself: the encrypted task output, the worker key, and the
/// one-time private key that requested it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubKeyBundle {
    pub task_id: String,
    pub encrypted_output: String,
    pub user_private_key: String,
    pub worker_pub_key: String,
}

/// Contract deployment addresses. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentAddrs {
    pub salad_contract: String,
    pub secret_contract: String,
    pub enigma_contract: String,
    pub enigma_token_contract: String,
}

/// Serde helper for amounts: written as decimal strings so JavaScript
/// clients keep full precision, read from either strings or numbers.
pub mod amount {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.trim().parse().map_err(de::Error::custom),
            Raw::Number(n) => Ok(n as u128),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deal_status_round_trips_through_text() {
        for status in [
            DealStatus::Created,
            DealStatus::Executing,
            DealStatus::Executed,
            DealStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DealStatus>().unwrap(), status);
        }
        assert!("pending".parse::<DealStatus>().is_err());
    }

    #[test]
    fn amount_accepts_strings_and_numbers() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(with = "amount")]
            value: u128,
        }

        let from_text: Wrapper = serde_json::from_str(r#"{"value":"100000000000000000000"}"#).unwrap();
        assert_eq!(from_text.value, 100_000_000_000_000_000_000);

        let from_number: Wrapper = serde_json::from_str(r#"{"value":10}"#).unwrap();
        assert_eq!(from_number.value, 10);

        assert!(serde_json::from_str::<Wrapper>(r#"{"value":"-1"}"#).is_err());
    }

    #[test]
    fn deposit_serializes_amount_as_string() {
        let deposit = Deposit {
            id: 1,
            sender: "0x1f0a".to_string(),
            amount: 10,
            pub_key: "ab".to_string(),
            enc_recipient: "cd".to_string(),
            signature: "ef".to_string(),
            deal_id: None,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&deposit).unwrap();
        assert_eq!(json["amount"], "10");
        assert_eq!(json["encRecipient"], "cd");
        assert!(json["dealId"].is_null());
    }
}
