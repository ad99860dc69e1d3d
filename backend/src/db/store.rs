//! # Ledger Store
//!
//! The durable record of deposits, deals and cached configuration. The
//! store holds no business logic: it only offers the atomic primitives the
//! deal manager builds on.
//!
//! Two implementations:
//!
//! | Store | Backing | Use |
//! |-------|---------|-----|
//! | [`PgStore`] | PostgreSQL via `deadpool-postgres` | Production |
//! | [`MemoryStore`](super::MemoryStore) | `tokio::sync::RwLock` | Development, tests |
//!
//! Every mutation is durable before the call returns.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::models::*;
use super::queries;
use super::{Database, DatabaseError};

/// Ledger store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The sender already has an unassigned deposit.
    #[error("Sender {0} already has an unassigned deposit")]
    DuplicateUnassignedDeposit(String),

    /// Deal assignment touched a different number of deposits than
    /// requested. Nothing was modified.
    #[error("Assignment mismatch for deal {deal_id}: {updated} deposits matched, {expected} expected")]
    AssignmentMismatch {
        deal_id: String,
        expected: usize,
        updated: usize,
    },

    #[error("Deal already exists: {0}")]
    DuplicateDeal(String),

    #[error("Deal not found: {0}")]
    DealNotFound(String),

    /// A cached value could not be encoded or decoded.
    #[error("Cache value {key} is invalid: {message}")]
    InvalidCacheValue { key: String, message: String },

    /// The store was closed.
    #[error("Store is closed")]
    Closed,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Durable deposit/deal ledger.
///
/// The typed cache accessors are provided on top of `get_cache` and
/// `set_cache`, so an implementation only deals with raw JSON values.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append a fillable deposit.
    async fn insert_deposit(&self, deposit: NewDeposit) -> Result<Deposit, StoreError>;

    /// Discard the sender's unassigned deposit, if any. Returns whether a
    /// deposit was discarded.
    async fn discard_deposit(&self, sender: &str) -> Result<bool, StoreError>;

    /// Unassigned deposits with `amount >= min_amount`, in insertion order.
    async fn query_fillable_deposits(&self, min_amount: u128) -> Result<Vec<Deposit>, StoreError>;

    /// Assign exactly the unassigned deposits of `senders` to `deal_id`,
    /// or nothing at all.
    async fn assign_deposits(&self, deal_id: &str, senders: &[String]) -> Result<(), StoreError>;

    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError>;

    /// Persist `status`, `tx_hash` and `task_id` of an existing deal.
    async fn update_deal(&self, deal: &Deal) -> Result<(), StoreError>;

    async fn get_deal(&self, deal_id: &str) -> Result<Option<Deal>, StoreError>;

    /// Deals with the given status (all deals when `None`), oldest first.
    async fn query_deals(&self, status: Option<DealStatus>) -> Result<Vec<Deal>, StoreError>;

    /// Deposits assigned to a deal, in insertion order.
    async fn get_deal_deposits(&self, deal_id: &str) -> Result<Vec<Deposit>, StoreError>;

    async fn get_cache(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn set_cache(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Remove all deposits, deals and cached values.
    async fn truncate(&self) -> Result<(), StoreError>;

    /// Release the store's resources. Later calls fail.
    async fn close(&self);

    async fn get_pub_key_bundle(&self) -> Result<Option<PubKeyBundle>, StoreError> {
        get_typed(self, CACHE_KEY_PUB_KEY_DATA).await
    }

    async fn set_pub_key_bundle(&self, bundle: &PubKeyBundle) -> Result<(), StoreError> {
        set_typed(self, CACHE_KEY_PUB_KEY_DATA, bundle).await
    }

    async fn get_last_mix_block(&self) -> Result<Option<u64>, StoreError> {
        get_typed(self, CACHE_KEY_LAST_MIX_BLOCK).await
    }

    /// Single writer: only the coordinator's settlement path calls this.
    async fn set_last_mix_block(&self, block: u64) -> Result<(), StoreError> {
        set_typed(self, CACHE_KEY_LAST_MIX_BLOCK, &block).await
    }

    async fn get_deployment(&self) -> Result<Option<DeploymentAddrs>, StoreError> {
        get_typed(self, CACHE_KEY_DEPLOYMENT).await
    }

    async fn set_deployment(&self, addrs: &DeploymentAddrs) -> Result<(), StoreError> {
        set_typed(self, CACHE_KEY_DEPLOYMENT, addrs).await
    }
}

async fn get_typed<S, T>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    S: LedgerStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get_cache(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::InvalidCacheValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

async fn set_typed<S, T>(store: &S, key: &str, value: &T) -> Result<(), StoreError>
where
    S: LedgerStore + ?Sized,
    T: Serialize + Sync,
{
    let value = serde_json::to_value(value).map_err(|e| StoreError::InvalidCacheValue {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.set_cache(key, value).await
}

/// PostgreSQL ledger store.
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn insert_deposit(&self, deposit: NewDeposit) -> Result<Deposit, StoreError> {
        match queries::insert_deposit(self.db.pool(), &deposit).await {
            Err(DatabaseError::UniqueViolation(sender)) => {
                Err(StoreError::DuplicateUnassignedDeposit(sender))
            }
            other => Ok(other?),
        }
    }

    async fn discard_deposit(&self, sender: &str) -> Result<bool, StoreError> {
        Ok(queries::discard_deposit(self.db.pool(), sender).await? > 0)
    }

    async fn query_fillable_deposits(&self, min_amount: u128) -> Result<Vec<Deposit>, StoreError> {
        Ok(queries::get_fillable_deposits(self.db.pool(), min_amount).await?)
    }

    async fn assign_deposits(&self, deal_id: &str, senders: &[String]) -> Result<(), StoreError> {
        let updated = queries::assign_deposits(self.db.pool(), deal_id, senders).await?;
        if updated != senders.len() as u64 {
            return Err(StoreError::AssignmentMismatch {
                deal_id: deal_id.to_string(),
                expected: senders.len(),
                updated: updated as usize,
            });
        }
        Ok(())
    }

    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        match queries::insert_deal(self.db.pool(), deal).await {
            Err(DatabaseError::UniqueViolation(id)) => Err(StoreError::DuplicateDeal(id)),
            other => Ok(other?),
        }
    }

    async fn update_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        match queries::update_deal(self.db.pool(), deal).await {
            Err(DatabaseError::NotFound(_)) => Err(StoreError::DealNotFound(deal.deal_id.clone())),
            other => Ok(other?),
        }
    }

    async fn get_deal(&self, deal_id: &str) -> Result<Option<Deal>, StoreError> {
        Ok(queries::get_deal(self.db.pool(), deal_id).await?)
    }

    async fn query_deals(&self, status: Option<DealStatus>) -> Result<Vec<Deal>, StoreError> {
        Ok(queries::get_deals(self.db.pool(), status).await?)
    }

    async fn get_deal_deposits(&self, deal_id: &str) -> Result<Vec<Deposit>, StoreError> {
        Ok(queries::get_deal_deposits(self.db.pool(), deal_id).await?)
    }

    async fn get_cache(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(queries::get_cache_value(self.db.pool(), key).await?)
    }

    async fn set_cache(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        Ok(queries::set_cache_value(self.db.pool(), key, &value).await?)
    }

    async fn truncate(&self) -> Result<(), StoreError> {
        Ok(queries::truncate_all(self.db.pool()).await?)
    }

    async fn close(&self) {
        info!("Closing PostgreSQL store");
        self.db.close();
    }
}
