//! Operator events and the notification actions they map to.
//!
//! The coordinator publishes [`OperatorEvent`]s on a broadcast channel.
//! The WebSocket layer forwards each one to every connected client as an
//! `{action, payload}` message.

use serde_json::json;

use crate::db::models::{Deal, PubKeyBundle};

/// Notification action names, outbound and inbound.
pub mod actions {
    // Outbound (server → client)
    pub const BLOCK_UPDATE: &str = "block_update";
    pub const PUB_KEY_UPDATE: &str = "pub_key_update";
    pub const DEAL_CREATED_UPDATE: &str = "deal_created_update";
    pub const DEAL_EXECUTED_UPDATE: &str = "deal_executed_update";
    pub const QUORUM_UPDATE: &str = "quorum_update";
    pub const QUORUM_NOT_REACHED_UPDATE: &str = "quorum_not_reached_update";
    pub const THRESHOLD_UPDATE: &str = "threshold_update";
    pub const SUBMIT_DEPOSIT_METADATA_RESULT: &str = "submit_deposit_metadata_result";
    pub const FETCH_FILLABLE_SUCCESS: &str = "fetch_fillable_success";
    pub const FETCH_CONFIG_SUCCESS: &str = "fetch_config_success";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    // Inbound (client → server)
    pub const PING: &str = "ping";
    pub const SUBMIT_DEPOSIT_METADATA: &str = "submit_deposit_metadata";
    pub const FETCH_FILLABLE_DEPOSITS: &str = "fetch_fillable_deposits";
    pub const FETCH_CONFIG: &str = "fetch_config";
}

/// A state change of the operator, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorEvent {
    /// Blocks left until the next settlement (may be negative).
    BlockCountdown(i64),
    /// The encryption public key bundle is available.
    PubKeyReady(PubKeyBundle),
    /// A deal was published on the public ledger.
    DealCreated(Deal),
    /// A deal's execute task was confirmed.
    DealExecuted(Deal),
    /// Number of fillable deposits.
    QuorumUpdated(usize),
    /// A settlement window elapsed without enough deposits.
    QuorumNotReached,
}

impl OperatorEvent {
    pub fn action(&self) -> &'static str {
        match self {
            OperatorEvent::BlockCountdown(_) => actions::BLOCK_UPDATE,
            OperatorEvent::PubKeyReady(_) => actions::PUB_KEY_UPDATE,
            OperatorEvent::DealCreated(_) => actions::DEAL_CREATED_UPDATE,
            OperatorEvent::DealExecuted(_) => actions::DEAL_EXECUTED_UPDATE,
            OperatorEvent::QuorumUpdated(_) => actions::QUORUM_UPDATE,
            OperatorEvent::QuorumNotReached => actions::QUORUM_NOT_REACHED_UPDATE,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            OperatorEvent::BlockCountdown(countdown) => json!({ "blockCountdown": countdown }),
            OperatorEvent::PubKeyReady(bundle) => json!({ "pubKeyData": bundle }),
            OperatorEvent::DealCreated(deal) | OperatorEvent::DealExecuted(deal) => {
                json!({ "deal": deal })
            }
            OperatorEvent::QuorumUpdated(quorum) => json!({ "quorum": quorum }),
            OperatorEvent::QuorumNotReached => json!({}),
        }
    }
}
