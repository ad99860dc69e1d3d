//! # Deal Manager Service
//!
//! Owns the deposit and deal lifecycle. It combines the ledger store, the
//! public ledger and the secret computation client, and is the only writer
//! of deals.
//!
//! ## Flow Example: Creating a Deal
//!
//! ```text
//! 1. reservation_context(): operator nonce and block height (ledger reads)
//!                ↓
//! 2. Coordinator selects equal-amount fillable deposits
//!                ↓
//! 3. reserve_deal(): nonce → dealId, lastMixBlock, insert deal,
//!    assign deposits (all or nothing)
//!                ↓
//! 4. publish_deal(): send newDeal, record tx hash, confirm receipt
//!                ↓
//! 5. execute_deal(): execute task on the confidential network
//! ```
//!
//! Steps 4 and 5 resume from what the store holds: a recorded transaction
//! hash is confirmed instead of sent again, and a recorded task is awaited
//! instead of submitted again.
//!
//! ## Deal Identifier
//!
//! ```text
//! dealId = keccak256(
//!     len8(amount32) || amount32
//!     || count8 || (len8(20) || participant20)*
//!     || len8(20) || operator20
//!     || len8(32) || nonce32
//! )
//! ```
//!
//! `len8`/`count8` are 8-byte big-endian integers. The nonce is the
//! operator's ledger transaction count, so two deals with identical
//! deposits still get distinct ids.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use alloy::primitives::{keccak256, U256};

use crate::compute::TaskStatus;
use crate::db::{Deal, DealStatus, Deposit, LedgerStore, NewDeposit, StoreError};
use crate::ledger::{LedgerContract, LedgerError, TxOpts};
use crate::utils::{address_bytes, decode_hex, encode_hex_prefixed};

use super::secret_compute::{SecretComputeClient, SecretComputeError, TaskResult};

/// Errors that can occur in deal operations.
#[derive(Debug, Error)]
pub enum DealError {
    /// The sender's on-ledger balance does not cover the deposit.
    #[error("Insufficient balance for {sender}: required {required}, available {available}")]
    InsufficientBalance {
        sender: String,
        required: u128,
        available: u128,
    },

    /// Deposit or deal data cannot be encoded.
    #[error("Invalid deal data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Compute(#[from] SecretComputeError),
}

impl DealError {
    /// The deposit set changed while a deal was being reserved.
    pub fn is_assignment_mismatch(&self) -> bool {
        matches!(self, DealError::Store(StoreError::AssignmentMismatch { .. }))
    }
}

/// Ledger state a deal reservation is based on, read before the store
/// side of the reservation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationContext {
    /// Operator transaction count, the deal id nonce.
    pub nonce: u64,
    /// Block recorded as `lastMixBlock`.
    pub block: u64,
}

/// The deal manager.
///
/// ## Usage
///
/// ```rust,ignore
/// let manager = DealManager::new(store, ledger, compute, &config.operator_address, 5, 4_712_388);
/// let countdown = manager.blocks_until_mix().await?;
/// ```
pub struct DealManager {
    store: Arc<dyn LedgerStore>,
    ledger: Arc<dyn LedgerContract>,
    compute: Arc<SecretComputeClient>,

    /// Lowercase operator account.
    operator_address: String,

    deal_interval_blocks: u64,
    create_deal_gas: u64,
}

impl DealManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        ledger: Arc<dyn LedgerContract>,
        compute: Arc<SecretComputeClient>,
        operator_address: &str,
        deal_interval_blocks: u64,
        create_deal_gas: u64,
    ) -> Self {
        Self {
            store,
            ledger,
            compute,
            operator_address: operator_address.to_lowercase(),
            deal_interval_blocks,
            create_deal_gas,
        }
    }

    // ==========================================
    // DEPOSITS
    // ==========================================

    /// Check that the sender's on-ledger balance covers the deposit.
    pub async fn check_balance(&self, deposit: &NewDeposit) -> Result<(), DealError> {
        let available = self.ledger.participant_balance(&deposit.sender).await?;
        if available < deposit.amount {
            return Err(DealError::InsufficientBalance {
                sender: deposit.sender.clone(),
                required: deposit.amount,
                available,
            });
        }
        Ok(())
    }

    /// Store a deposit whose balance was checked with
    /// [`check_balance`](Self::check_balance).
    pub async fn record_deposit(&self, deposit: NewDeposit) -> Result<Deposit, DealError> {
        let stored = self.store.insert_deposit(deposit).await?;
        info!(
            "Deposit registered: {} from {} (amount {})",
            stored.id, stored.sender, stored.amount
        );
        Ok(stored)
    }

    /// Fillable deposits of at least `min_amount`, in insertion order.
    pub async fn balance_fillable_deposits(&self, min_amount: u128) -> Result<Vec<Deposit>, DealError> {
        Ok(self.store.query_fillable_deposits(min_amount).await?)
    }

    /// Re-check the on-ledger balance behind every fillable deposit and
    /// discard the ones no longer funded. Returns the funded deposits.
    pub async fn screen_fillable_deposits(&self, min_amount: u128) -> Result<Vec<Deposit>, DealError> {
        let mut funded = Vec::new();
        for deposit in self.store.query_fillable_deposits(min_amount).await? {
            let available = self.ledger.participant_balance(&deposit.sender).await?;
            if available >= deposit.amount {
                funded.push(deposit);
                continue;
            }

            warn!(
                "Discarding deposit {} of {}: balance {} below amount {}",
                deposit.id, deposit.sender, available, deposit.amount
            );
            self.store.discard_deposit(&deposit.sender).await?;
        }
        Ok(funded)
    }

    // ==========================================
    // SETTLEMENT WINDOW
    // ==========================================

    /// Blocks left until the next settlement. Negative once overdue.
    ///
    /// Without a recorded `lastMixBlock` the current block is used.
    pub async fn blocks_until_mix(&self) -> Result<i64, DealError> {
        let current = self.ledger.block_number().await?;
        let last = self.store.get_last_mix_block().await?.unwrap_or(current);
        let countdown = (last + self.deal_interval_blocks) as i64 - current as i64;
        debug!("Blocks until mix: {} (last {}, current {})", countdown, last, current);
        Ok(countdown)
    }

    /// Record the current block as the last settlement.
    pub async fn update_last_mix_block(&self) -> Result<u64, DealError> {
        let block = self.ledger.block_number().await?;
        self.store.set_last_mix_block(block).await?;
        debug!("lastMixBlock set to {}", block);
        Ok(block)
    }

    // ==========================================
    // DEALS
    // ==========================================

    /// Read the operator nonce and the block height for the next reservation.
    pub async fn reservation_context(&self) -> Result<ReservationContext, DealError> {
        let nonce = self.ledger.transaction_count(&self.operator_address).await?;
        let block = self.ledger.block_number().await?;
        Ok(ReservationContext { nonce, block })
    }

    /// Store side of deal creation.
    ///
    /// Derives the deal id, moves `lastMixBlock`, inserts the deal and
    /// assigns the deposits atomically. When the assignment loses a race the
    /// deal is marked `Failed` and the mismatch is returned.
    pub async fn reserve_deal(
        &self,
        amount: u128,
        deposits: &[Deposit],
        context: ReservationContext,
    ) -> Result<Deal, DealError> {
        let participants: Vec<String> = deposits.iter().map(|d| d.sender.clone()).collect();
        let nonce = context.nonce;
        let deal_id = derive_deal_id(amount, &participants, &self.operator_address, nonce)
            .map_err(DealError::InvalidData)?;

        self.store.set_last_mix_block(context.block).await?;
        debug!("lastMixBlock set to {}", context.block);

        let now = Utc::now();
        let mut deal = Deal {
            deal_id: deal_id.clone(),
            deposit_amount: amount,
            participants: participants.clone(),
            nonce,
            status: DealStatus::Created,
            tx_hash: None,
            task_id: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_deal(&deal).await {
            Ok(()) => {}
            Err(StoreError::DuplicateDeal(_)) => {
                // A failed reservation of the same deposits at the same nonce
                let existing = self
                    .store
                    .get_deal(&deal_id)
                    .await?
                    .filter(|d| d.status == DealStatus::Failed)
                    .ok_or(StoreError::DuplicateDeal(deal_id.clone()))?;
                deal.created_at = existing.created_at;
                self.store.update_deal(&deal).await?;
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.store.assign_deposits(&deal_id, &participants).await {
            deal.status = DealStatus::Failed;
            self.store.update_deal(&deal).await?;
            warn!("Deal {} failed to reserve its deposits: {}", deal_id, e);
            return Err(e.into());
        }

        info!(
            "Deal reserved: {} ({} participants, amount {}, nonce {})",
            deal_id,
            participants.len(),
            amount,
            nonce
        );
        Ok(deal)
    }

    async fn stored_deal(&self, deal_id: &str) -> Result<Deal, DealError> {
        Ok(self
            .store
            .get_deal(deal_id)
            .await?
            .ok_or_else(|| StoreError::DealNotFound(deal_id.to_string()))?)
    }

    /// Ledger side of deal creation.
    ///
    /// Sends `newDeal` unless the stored deal already records a transaction,
    /// persists the hash right away, then waits for the receipt. A reverted
    /// transaction left nothing on the ledger, so its hash is cleared and
    /// the next attempt sends again. Deals past `Created` are returned as is.
    pub async fn publish_deal(&self, deal: &Deal) -> Result<Deal, DealError> {
        let mut deal = self.stored_deal(&deal.deal_id).await?;
        if deal.status != DealStatus::Created {
            return Ok(deal);
        }

        let tx_hash = match deal.tx_hash.clone() {
            Some(tx_hash) => {
                debug!("Deal {} already sent in {}, confirming", deal.deal_id, tx_hash);
                tx_hash
            }
            None => {
                let id = deal_id_bytes(&deal.deal_id)?;
                let opts = TxOpts {
                    from: self.operator_address.clone(),
                    gas: self.create_deal_gas,
                };
                let tx_hash = self
                    .ledger
                    .send_new_deal(&id, deal.deposit_amount, &deal.participants, &opts)
                    .await?;

                deal.tx_hash = Some(tx_hash.clone());
                deal.updated_at = Utc::now();
                self.store.update_deal(&deal).await?;
                tx_hash
            }
        };

        if let Err(e) = self.ledger.confirm_transaction(&tx_hash).await {
            if matches!(e, LedgerError::Reverted(_)) {
                deal.tx_hash = None;
                deal.updated_at = Utc::now();
                self.store.update_deal(&deal).await?;
            }
            return Err(e.into());
        }

        info!("Deal published: {} (tx {})", deal.deal_id, tx_hash);
        Ok(deal)
    }

    /// Run the execute task of a published deal and wait for it.
    ///
    /// A task recorded by an earlier attempt is awaited first; a new one is
    /// submitted only if that task failed.
    pub async fn execute_deal(&self, deal: &Deal) -> Result<Deal, DealError> {
        let mut deal = self.stored_deal(&deal.deal_id).await?;
        if deal.status == DealStatus::Executed {
            return Ok(deal);
        }

        if let Some(task_id) = deal.task_id.clone() {
            match self.compute.await_task(&task_id).await? {
                TaskStatus::Confirmed => {
                    info!("Task {} of deal {} already confirmed", task_id, deal.deal_id);
                    return self.mark_executed(deal).await;
                }
                status => warn!(
                    "Task {} of deal {} ended {:?}, submitting a new one",
                    task_id, deal.deal_id, status
                ),
            }
        }

        let deposits = self.store.get_deal_deposits(&deal.deal_id).await?;
        let chain_id = self.ledger.chain_id().await?;

        let task = self
            .compute
            .execute_deal(deal.deposit_amount, &deposits, deal.nonce, chain_id)
            .await?;

        deal.status = DealStatus::Executing;
        deal.task_id = Some(task.task_id.clone());
        deal.updated_at = Utc::now();
        self.store.update_deal(&deal).await?;

        self.compute.complete(task).await?;
        self.mark_executed(deal).await
    }

    async fn mark_executed(&self, mut deal: Deal) -> Result<Deal, DealError> {
        deal.status = DealStatus::Executed;
        deal.updated_at = Utc::now();
        self.store.update_deal(&deal).await?;

        info!("Deal executed: {} (task {:?})", deal.deal_id, deal.task_id);
        Ok(deal)
    }

    /// Deals a crash left between reservation and execution, oldest first.
    pub async fn pending_deals(&self) -> Result<Vec<Deal>, DealError> {
        let mut deals = self.store.query_deals(Some(DealStatus::Created)).await?;
        deals.extend(self.store.query_deals(Some(DealStatus::Executing)).await?);
        deals.sort_by_key(|d| d.created_at);
        Ok(deals)
    }

    /// Have the confidential network check deposits that did not make a deal.
    pub async fn verify_deposits(&self, amount: u128, deposits: &[Deposit]) -> Result<TaskResult, DealError> {
        let chain_id = self.ledger.chain_id().await?;
        Ok(self.compute.verify_deposits(amount, deposits, chain_id).await?)
    }
}

/// The largest group of equal-amount deposits, if it reaches `threshold`.
///
/// Ties go to the group whose first deposit was inserted first. Deposits
/// keep their insertion order.
pub fn select_deal_candidates(deposits: &[Deposit], threshold: usize) -> Option<(u128, Vec<Deposit>)> {
    let mut buckets: BTreeMap<u128, Vec<Deposit>> = BTreeMap::new();
    for deposit in deposits {
        buckets.entry(deposit.amount).or_default().push(deposit.clone());
    }

    let (amount, bucket) = buckets.into_iter().max_by(|(_, a), (_, b)| {
        a.len()
            .cmp(&b.len())
            .then_with(|| b[0].id.cmp(&a[0].id))
    })?;

    if bucket.len() < threshold.max(1) {
        return None;
    }
    Some((amount, bucket))
}

/// Length-prefixed message hashed into a deal id.
pub fn deal_id_message(
    amount: u128,
    participants: &[String],
    operator: &str,
    nonce: u64,
) -> Result<Vec<u8>, String> {
    fn push_param(message: &mut Vec<u8>, param: &[u8]) {
        message.extend_from_slice(&(param.len() as u64).to_be_bytes());
        message.extend_from_slice(param);
    }

    let mut message = Vec::with_capacity(40 + 8 + participants.len() * 28 + 28 + 40);
    push_param(&mut message, &U256::from(amount).to_be_bytes::<32>());

    message.extend_from_slice(&(participants.len() as u64).to_be_bytes());
    for participant in participants {
        push_param(&mut message, &address_bytes(participant)?);
    }

    push_param(&mut message, &address_bytes(operator)?);
    push_param(&mut message, &U256::from(nonce).to_be_bytes::<32>());
    Ok(message)
}

/// Deal id (`0x` hex) of a deal over `participants`.
pub fn derive_deal_id(
    amount: u128,
    participants: &[String],
    operator: &str,
    nonce: u64,
) -> Result<String, String> {
    let message = deal_id_message(amount, participants, operator, nonce)?;
    Ok(encode_hex_prefixed(keccak256(&message).as_slice()))
}

fn deal_id_bytes(deal_id: &str) -> Result<[u8; 32], DealError> {
    decode_hex(deal_id)
        .map_err(DealError::InvalidData)?
        .try_into()
        .map_err(|_| DealError::InvalidData(format!("deal id is not 32 bytes: {}", deal_id)))
}
