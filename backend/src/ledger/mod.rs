//! # Public Ledger Module
//!
//! This module provides the operator's view of the salad contract on the
//! public ledger (Ethereum JSON-RPC through an `alloy` provider).
//!
//! ## Responsibilities
//!
//! - Read the current block height and chain id
//! - Read a participant's on-ledger balance
//! - Read the operator's transaction count (deal id nonce)
//! - Send `newDeal` from the node-managed operator account
//! - Confirm a sent transaction by polling its receipt
//!
//! ## Flow of `newDeal`
//!
//! ```text
//! 1. ISalad::newDealCall { .. }.abi_encode()
//!              ↓
//! 2. eth_sendTransaction from the operator account ──> tx hash (persisted by the caller)
//!              ↓
//! 3. Poll eth_getTransactionReceipt(tx hash) until mined or timed out
//!              ↓
//! 4. receipt.status() == true → confirmed
//! ```
//!
//! Sending and confirming are separate calls: a confirmation that times out
//! is repeated with the same hash and never sends a second transaction.

use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;
use alloy::transports::http::reqwest::Url;
use alloy::transports::TransportError;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::utils::encode_hex_prefixed;

sol! {
    /// Salad contract methods called by the operator.
    interface ISalad {
        function getParticipantBalance(address account) external view returns (uint256);
        function newDeal(bytes32 dealId, uint256 amount, address[] participants) external;
    }
}

/// Ledger errors.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger RPC failed: {0}")]
    Rpc(#[from] TransportError),

    #[error("Invalid call argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),

    #[error("Transaction {0} reverted")]
    Reverted(String),

    #[error("No receipt for transaction {0} before timeout")]
    ReceiptTimeout(String),
}

/// Sender options of a ledger transaction.
#[derive(Debug, Clone)]
pub struct TxOpts {
    pub from: String,
    pub gas: u64,
}

/// Operations the operator performs against the public ledger.
#[async_trait]
pub trait LedgerContract: Send + Sync {
    async fn block_number(&self) -> Result<u64, LedgerError>;

    async fn chain_id(&self) -> Result<u64, LedgerError>;

    /// Amount the account has deposited into the salad contract.
    async fn participant_balance(&self, account: &str) -> Result<u128, LedgerError>;

    /// Number of transactions sent from `account` so far.
    async fn transaction_count(&self, account: &str) -> Result<u64, LedgerError>;

    /// Send `newDeal` once. Returns the transaction hash as soon as the
    /// node accepted it.
    async fn send_new_deal(
        &self,
        deal_id: &[u8; 32],
        amount: u128,
        participants: &[String],
        opts: &TxOpts,
    ) -> Result<String, LedgerError>;

    /// Wait for `tx_hash` to be mined. Fails with `Reverted` when it was
    /// mined unsuccessfully and `ReceiptTimeout` when it is still pending.
    async fn confirm_transaction(&self, tx_hash: &str) -> Result<(), LedgerError>;
}

fn parse_address(address: &str) -> Result<Address, LedgerError> {
    address
        .trim()
        .parse()
        .map_err(|e| LedgerError::InvalidArgument(format!("address {}: {}", address, e)))
}

/// `alloy` implementation of [`LedgerContract`].
///
/// ## Usage
///
/// ```rust,ignore
/// let ledger = EthRpcLedger::new(&config.eth_rpc_url, &deployment.salad_contract, config.receipt_timeout)?;
/// let height = ledger.block_number().await?;
/// ```
pub struct EthRpcLedger {
    provider: DynProvider,

    /// Salad contract address.
    contract: Address,

    receipt_timeout: Duration,
    receipt_poll_interval: Duration,

    chain_id: OnceCell<u64>,
}

impl EthRpcLedger {
    pub fn new(rpc_url: &str, contract: &str, receipt_timeout: Duration) -> Result<Self, LedgerError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| LedgerError::InvalidArgument(format!("RPC URL {}: {}", rpc_url, e)))?;
        let contract = parse_address(contract)?;
        let provider = DynProvider::new(ProviderBuilder::new().connect_http(url));

        info!("Ledger client initialized:");
        info!("  RPC: {}", rpc_url);
        info!("  Salad contract: {}", contract);

        Ok(Self {
            provider,
            contract,
            receipt_timeout,
            receipt_poll_interval: Duration::from_secs(1),
            chain_id: OnceCell::new(),
        })
    }
}

#[async_trait]
impl LedgerContract for EthRpcLedger {
    async fn block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        self.chain_id
            .get_or_try_init(|| async { Ok::<_, LedgerError>(self.provider.get_chain_id().await?) })
            .await
            .copied()
    }

    async fn participant_balance(&self, account: &str) -> Result<u128, LedgerError> {
        let call = ISalad::getParticipantBalanceCall {
            account: parse_address(account)?,
        };
        let tx = TransactionRequest::default()
            .to(self.contract)
            .input(call.abi_encode().into());

        let output = self.provider.call(tx).await?;
        let balance = ISalad::getParticipantBalanceCall::abi_decode_returns(&output)
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        let balance = u128::try_from(balance)
            .map_err(|_| LedgerError::InvalidResponse(format!("balance does not fit into 128 bits: {}", balance)))?;

        debug!("Balance of {}: {}", account, balance);
        Ok(balance)
    }

    async fn transaction_count(&self, account: &str) -> Result<u64, LedgerError> {
        Ok(self.provider.get_transaction_count(parse_address(account)?).await?)
    }

    async fn send_new_deal(
        &self,
        deal_id: &[u8; 32],
        amount: u128,
        participants: &[String],
        opts: &TxOpts,
    ) -> Result<String, LedgerError> {
        let call = ISalad::newDealCall {
            dealId: B256::from(*deal_id),
            amount: U256::from(amount),
            participants: participants
                .iter()
                .map(|p| parse_address(p))
                .collect::<Result<Vec<_>, _>>()?,
        };
        let tx = TransactionRequest::default()
            .from(parse_address(&opts.from)?)
            .to(self.contract)
            .gas_limit(opts.gas)
            .input(call.abi_encode().into());

        // Single attempt: a repeated send could create the deal twice
        let pending = self.provider.send_transaction(tx).await?;
        let tx_hash = encode_hex_prefixed(pending.tx_hash().as_slice());
        info!("newDeal sent: {} ({} participants)", tx_hash, participants.len());
        Ok(tx_hash)
    }

    async fn confirm_transaction(&self, tx_hash: &str) -> Result<(), LedgerError> {
        let hash: B256 = tx_hash
            .parse()
            .map_err(|e| LedgerError::InvalidArgument(format!("transaction hash {}: {}", tx_hash, e)))?;

        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        loop {
            if let Some(receipt) = self.provider.get_transaction_receipt(hash).await? {
                if !receipt.status() {
                    warn!("Transaction {} reverted", tx_hash);
                    return Err(LedgerError::Reverted(tx_hash.to_string()));
                }
                info!("Transaction {} mined in block {:?}", tx_hash, receipt.block_number);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LedgerError::ReceiptTimeout(tx_hash.to_string()));
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }
}
