//! Test doubles for the public ledger and the confidential network, and a
//! harness wiring them to the in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::compute::keys::{parse_public_key, seal, shared_key, TaskKeyPair};
use crate::compute::{ComputeError, ComputeTransport, TaskOutput, TaskRequest, TaskStatus};
use crate::config::GasConfig;
use crate::db::{Deposit, DeploymentAddrs, LedgerStore, MemoryStore, NewDeposit};
use crate::ledger::{LedgerContract, LedgerError, TxOpts};
use crate::services::signature::tests::account;
use crate::services::{DealManager, OperatorCoordinator, RetryPolicy, SecretComputeClient};
use crate::utils::encode_hex_prefixed;

pub const OPERATOR: &str = "0x627306090abab3a6e1400e9345bc60c78a8bef57";
pub const SECRET_CONTRACT: &str = "0x00000000000000000000000000000000000000cc";

/// Account controlled by the secret key `[seed; 32]`.
pub fn address(seed: u8) -> String {
    account(seed).1
}

pub fn gas_config() -> GasConfig {
    GasConfig {
        task_gas_price: 1,
        pub_key_gas_limit: 5_000_000,
        deal_base_gas: 5_000_000,
        deal_participant_gas: 100_000_000,
        create_deal_gas: 4_712_388,
    }
}

pub fn deployment() -> DeploymentAddrs {
    DeploymentAddrs {
        salad_contract: "0x00000000000000000000000000000000000000aa".to_string(),
        secret_contract: SECRET_CONTRACT.to_string(),
        enigma_contract: "0x00000000000000000000000000000000000000ee".to_string(),
        enigma_token_contract: "0x00000000000000000000000000000000000000ef".to_string(),
    }
}

pub fn new_deposit(sender: &str, amount: u128) -> NewDeposit {
    NewDeposit {
        sender: sender.to_string(),
        amount,
        pub_key: "04ab".to_string(),
        enc_recipient: "e0cd".to_string(),
        signature: format!("0x{}", "11".repeat(65)),
    }
}

pub fn deposit(id: i64, sender: &str, amount: u128) -> Deposit {
    let new = new_deposit(sender, amount);
    Deposit {
        id,
        sender: new.sender,
        amount,
        pub_key: new.pub_key,
        enc_recipient: new.enc_recipient,
        signature: new.signature,
        deal_id: None,
        created_at: Utc::now(),
    }
}

// ==========================================
// PUBLIC LEDGER
// ==========================================

#[derive(Debug, Clone, PartialEq)]
pub struct NewDealCall {
    pub deal_id: String,
    pub amount: u128,
    pub participants: Vec<String>,
}

struct SentTransaction {
    tx_hash: String,
    call: NewDealCall,
    reverted: bool,
}

#[derive(Default)]
struct LedgerState {
    block: u64,
    tx_count: u64,
    balances: HashMap<String, u128>,
    sent: Vec<SentTransaction>,
    new_deal_failures: u32,
    receipt_timeouts: u32,
}

/// Public ledger on chain id 1 with settable blocks and balances. Sent
/// transactions are mined at once unless told otherwise.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block(&self, block: u64) {
        self.state.lock().unwrap().block = block;
    }

    pub fn set_balance(&self, account: &str, balance: u128) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(account.to_lowercase(), balance);
    }

    /// Make the next `times` `newDeal` transactions revert.
    pub fn fail_new_deal(&self, times: u32) {
        self.state.lock().unwrap().new_deal_failures = times;
    }

    /// Make the next `times` confirmations time out, as if the
    /// transaction were still pending.
    pub fn time_out_receipts(&self, times: u32) {
        self.state.lock().unwrap().receipt_timeouts = times;
    }

    /// `newDeal` transactions mined successfully.
    pub fn new_deal_calls(&self) -> Vec<NewDealCall> {
        let state = self.state.lock().unwrap();
        state
            .sent
            .iter()
            .filter(|tx| !tx.reverted)
            .map(|tx| tx.call.clone())
            .collect()
    }

    /// All `newDeal` transactions sent, reverted ones included.
    pub fn sent_new_deals(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }
}

#[async_trait]
impl LedgerContract for FakeLedger {
    async fn block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().unwrap().block)
    }

    async fn chain_id(&self) -> Result<u64, LedgerError> {
        Ok(1)
    }

    async fn participant_balance(&self, account: &str) -> Result<u128, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.balances.get(&account.to_lowercase()).copied().unwrap_or(0))
    }

    async fn transaction_count(&self, _account: &str) -> Result<u64, LedgerError> {
        Ok(self.state.lock().unwrap().tx_count)
    }

    async fn send_new_deal(
        &self,
        deal_id: &[u8; 32],
        amount: u128,
        participants: &[String],
        _opts: &TxOpts,
    ) -> Result<String, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let reverted = state.new_deal_failures > 0;
        if reverted {
            state.new_deal_failures -= 1;
        }

        state.tx_count += 1;
        let tx_hash = format!("0x{:064x}", state.tx_count);
        state.sent.push(SentTransaction {
            tx_hash: tx_hash.clone(),
            call: NewDealCall {
                deal_id: encode_hex_prefixed(deal_id),
                amount,
                participants: participants.to_vec(),
            },
            reverted,
        });
        Ok(tx_hash)
    }

    async fn confirm_transaction(&self, tx_hash: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.receipt_timeouts > 0 {
            state.receipt_timeouts -= 1;
            return Err(LedgerError::ReceiptTimeout(tx_hash.to_string()));
        }

        match state.sent.iter().find(|tx| tx.tx_hash == tx_hash) {
            Some(tx) if tx.reverted => Err(LedgerError::Reverted(tx_hash.to_string())),
            Some(_) => Ok(()),
            None => Err(LedgerError::InvalidArgument(format!("unknown transaction {}", tx_hash))),
        }
    }
}

// ==========================================
// CONFIDENTIAL NETWORK
// ==========================================

#[derive(Default)]
struct ComputeState {
    requests: Vec<TaskRequest>,
    tasks: HashMap<String, TaskRequest>,
    statuses: VecDeque<TaskStatus>,
    outputs: HashMap<String, Vec<u8>>,
    status_polls: usize,
}

/// Confidential network whose worker seals real outputs for the
/// submitting key pair. Tasks confirm at once unless statuses are scripted.
pub struct FakeComputeTransport {
    worker: TaskKeyPair,
    state: Mutex<ComputeState>,
}

impl FakeComputeTransport {
    pub fn new() -> Self {
        Self {
            worker: TaskKeyPair::generate(),
            state: Mutex::new(ComputeState::default()),
        }
    }

    /// Output returned by every task of `task_fn`.
    pub fn set_output(&self, task_fn: &str, output: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(task_fn.to_string(), output);
    }

    /// Statuses returned by the next polls, in order.
    pub fn script_statuses(&self, statuses: Vec<TaskStatus>) {
        self.state.lock().unwrap().statuses = statuses.into();
    }

    pub fn requests(&self) -> Vec<TaskRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn status_polls(&self) -> usize {
        self.state.lock().unwrap().status_polls
    }
}

#[async_trait]
impl ComputeTransport for FakeComputeTransport {
    async fn submit_task(&self, request: &TaskRequest) -> Result<String, ComputeError> {
        let mut state = self.state.lock().unwrap();
        let task_id = format!("0x{:064x}", state.requests.len() + 1);
        state.requests.push(request.clone());
        state.tasks.insert(task_id.clone(), request.clone());
        Ok(task_id)
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, ComputeError> {
        let mut state = self.state.lock().unwrap();
        if !state.tasks.contains_key(task_id) {
            return Err(ComputeError::InvalidResponse(format!("unknown task {}", task_id)));
        }
        state.status_polls += 1;
        Ok(state.statuses.pop_front().unwrap_or(TaskStatus::Confirmed))
    }

    async fn task_output(&self, task_id: &str) -> Result<TaskOutput, ComputeError> {
        let state = self.state.lock().unwrap();
        let request = state
            .tasks
            .get(task_id)
            .ok_or_else(|| ComputeError::InvalidResponse(format!("unknown task {}", task_id)))?;
        let output = state
            .outputs
            .get(&request.task_fn)
            .cloned()
            .unwrap_or_else(|| b"ok".to_vec());

        let user = parse_public_key(&request.user_pub_key)?;
        let blob = seal(&shared_key(self.worker.secret_key(), &user), &output)?;
        Ok(TaskOutput {
            encrypted_output: encode_hex_prefixed(&blob),
            worker_encryption_key: self.worker.public_key_hex(),
        })
    }
}

// ==========================================
// HARNESS
// ==========================================

/// Coordinator stack over the in-memory store and the fakes: threshold 2,
/// a 5-block deal interval, 10 s retry pause.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<FakeLedger>,
    pub compute: Arc<FakeComputeTransport>,
    pub client: Arc<SecretComputeClient>,
    pub manager: Arc<DealManager>,
    pub coordinator: Arc<OperatorCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(|memory| memory as Arc<dyn LedgerStore>)
    }

    /// Harness whose services use the store `wrap` builds around the
    /// in-memory store. `store` keeps pointing at the in-memory store.
    pub fn with_store<F>(wrap: F) -> Self
    where
        F: FnOnce(Arc<MemoryStore>) -> Arc<dyn LedgerStore>,
    {
        let store = Arc::new(MemoryStore::new());
        let services_store = wrap(store.clone());
        let ledger = Arc::new(FakeLedger::new());
        let compute = Arc::new(FakeComputeTransport::new());

        let client = Arc::new(SecretComputeClient::new(
            compute.clone(),
            services_store.clone(),
            OPERATOR,
            SECRET_CONTRACT,
            Duration::from_secs(1),
            gas_config(),
        ));
        let manager = Arc::new(DealManager::new(
            services_store.clone(),
            ledger.clone(),
            client.clone(),
            OPERATOR,
            5,
            gas_config().create_deal_gas,
        ));
        let coordinator = Arc::new(OperatorCoordinator::new(
            manager.clone(),
            services_store,
            ledger.clone(),
            client.clone(),
            deployment(),
            2,
            Duration::from_secs(10),
            RetryPolicy::unbounded(Duration::from_secs(10)),
        ));

        Self {
            store,
            ledger,
            compute,
            client,
            manager,
            coordinator,
        }
    }

    /// Set the on-ledger balance of `address(seed)` for each `(seed, balance)`.
    pub fn fund_accounts(&self, balances: &[(u8, u128)]) {
        for (seed, balance) in balances {
            self.ledger.set_balance(&address(*seed), *balance);
        }
    }

    /// Fund each account and register a deposit of the same amount.
    pub async fn fund_and_register(&self, deposits: &[(u8, u128)]) {
        self.fund_accounts(deposits);
        for (seed, amount) in deposits {
            self.manager
                .record_deposit(new_deposit(&address(*seed), *amount))
                .await
                .unwrap();
        }
    }
}
