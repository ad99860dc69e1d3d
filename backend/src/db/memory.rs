//! In-memory ledger store.
//!
//! Every operation takes one lock over the whole ledger, which gives the
//! same atomicity as the PostgreSQL store: the per-sender uniqueness check
//! happens under the lock of the insert, and an assignment is validated
//! before any deposit is touched. Nothing survives a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::models::*;
use super::store::{LedgerStore, StoreError};

#[derive(Default)]
struct Ledger {
    deposits: Vec<Deposit>,
    deals: Vec<Deal>,
    cache: HashMap<String, serde_json::Value>,
    next_deposit_id: i64,
    closed: bool,
}

impl Ledger {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Ledger store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_deposit(&self, deposit: NewDeposit) -> Result<Deposit, StoreError> {
        let mut ledger = self.inner.write().await;
        ledger.ensure_open()?;

        if ledger
            .deposits
            .iter()
            .any(|d| d.is_fillable() && d.sender == deposit.sender)
        {
            return Err(StoreError::DuplicateUnassignedDeposit(deposit.sender));
        }

        ledger.next_deposit_id += 1;
        let record = Deposit {
            id: ledger.next_deposit_id,
            sender: deposit.sender,
            amount: deposit.amount,
            pub_key: deposit.pub_key,
            enc_recipient: deposit.enc_recipient,
            signature: deposit.signature,
            deal_id: None,
            created_at: Utc::now(),
        };
        ledger.deposits.push(record.clone());
        Ok(record)
    }

    async fn discard_deposit(&self, sender: &str) -> Result<bool, StoreError> {
        let mut ledger = self.inner.write().await;
        ledger.ensure_open()?;

        match ledger
            .deposits
            .iter_mut()
            .find(|d| d.is_fillable() && d.sender == sender)
        {
            Some(deposit) => {
                deposit.deal_id = Some(DISCARDED_DEAL_ID.to_string());
                info!("Deposit discarded for sender: {}", sender);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query_fillable_deposits(&self, min_amount: u128) -> Result<Vec<Deposit>, StoreError> {
        let ledger = self.inner.read().await;
        ledger.ensure_open()?;

        Ok(ledger
            .deposits
            .iter()
            .filter(|d| d.is_fillable() && d.amount >= min_amount)
            .cloned()
            .collect())
    }

    async fn assign_deposits(&self, deal_id: &str, senders: &[String]) -> Result<(), StoreError> {
        let mut ledger = self.inner.write().await;
        ledger.ensure_open()?;

        let matched: Vec<usize> = ledger
            .deposits
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_fillable() && senders.contains(&d.sender))
            .map(|(i, _)| i)
            .collect();

        if matched.len() != senders.len() {
            warn!(
                "Assignment to deal {} rejected: {} deposits matched, {} expected",
                deal_id,
                matched.len(),
                senders.len()
            );
            return Err(StoreError::AssignmentMismatch {
                deal_id: deal_id.to_string(),
                expected: senders.len(),
                updated: matched.len(),
            });
        }

        for i in matched {
            ledger.deposits[i].deal_id = Some(deal_id.to_string());
        }
        Ok(())
    }

    async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        let mut ledger = self.inner.write().await;
        ledger.ensure_open()?;

        if ledger.deals.iter().any(|d| d.deal_id == deal.deal_id) {
            return Err(StoreError::DuplicateDeal(deal.deal_id.clone()));
        }
        ledger.deals.push(deal.clone());
        Ok(())
    }

    async fn update_deal(&self, deal: &Deal) -> Result<(), StoreError> {
        let mut ledger = self.inner.write().await;
        ledger.ensure_open()?;

        let stored = ledger
            .deals
            .iter_mut()
            .find(|d| d.deal_id == deal.deal_id)
            .ok_or_else(|| StoreError::DealNotFound(deal.deal_id.clone()))?;
        stored.status = deal.status;
        stored.tx_hash = deal.tx_hash.clone();
        stored.task_id = deal.task_id.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn get_deal(&self, deal_id: &str) -> Result<Option<Deal>, StoreError> {
        let ledger = self.inner.read().await;
        ledger.ensure_open()?;
        Ok(ledger.deals.iter().find(|d| d.deal_id == deal_id).cloned())
    }

    async fn query_deals(&self, status: Option<DealStatus>) -> Result<Vec<Deal>, StoreError> {
        let ledger = self.inner.read().await;
        ledger.ensure_open()?;

        Ok(ledger
            .deals
            .iter()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect())
    }

    async fn get_deal_deposits(&self, deal_id: &str) -> Result<Vec<Deposit>, StoreError> {
        let ledger = self.inner.read().await;
        ledger.ensure_open()?;

        Ok(ledger
            .deposits
            .iter()
            .filter(|d| d.deal_id.as_deref() == Some(deal_id))
            .cloned()
            .collect())
    }

    async fn get_cache(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let ledger = self.inner.read().await;
        ledger.ensure_open()?;
        Ok(ledger.cache.get(key).cloned())
    }

    async fn set_cache(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let mut ledger = self.inner.write().await;
        ledger.ensure_open()?;
        ledger.cache.insert(key.to_string(), value);
        Ok(())
    }

    async fn truncate(&self) -> Result<(), StoreError> {
        let mut ledger = self.inner.write().await;
        ledger.ensure_open()?;
        ledger.deposits.clear();
        ledger.deals.clear();
        ledger.cache.clear();
        ledger.next_deposit_id = 0;
        warn!("Truncated in-memory ledger");
        Ok(())
    }

    async fn close(&self) {
        self.inner.write().await.closed = true;
        info!("Closing in-memory store");
    }
}
