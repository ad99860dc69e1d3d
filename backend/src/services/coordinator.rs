//! # Operator Coordinator
//!
//! Drives settlement windows and serves depositors. It is the only
//! producer of [`OperatorEvent`]s.
//!
//! ## Settlement Cycle
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  every poll interval (while active)                            │
//! │                                                                │
//! │  blocks_until_mix ──> BlockCountdown                           │
//! │         │                                                      │
//! │     > 0 └──> wait                                              │
//! │    <= 0 ──> screen deposits ──> select equal-amount bucket     │
//! │                │                                               │
//! │    quorum ─────┼─────────────────────────── no quorum          │
//! │      ↓                                           ↓             │
//! │  reserve deal ──> QuorumUpdated           lastMixBlock         │
//! │  publish (retry) ──> DealCreated          verify (retry)       │
//! │  execute (retry) ──> DealExecuted         QuorumNotReached     │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A durable change and the event that reports it are made under one
//! async mutex, so subscribers observe events in commit order. Ledger
//! reads (balances, nonce, block height) happen before it is taken, and
//! calls that may take long (publication, task polling) run outside it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::db::{Deal, DealStatus, Deposit, DeploymentAddrs, LedgerStore, NewDeposit, PubKeyBundle, StoreError};
use crate::ledger::{LedgerContract, LedgerError};

use super::deal_manager::{select_deal_candidates, DealError, DealManager};
use super::events::OperatorEvent;
use super::retry::RetryPolicy;
use super::secret_compute::{SecretComputeClient, SecretComputeError};
use super::signature::{self, DepositPayload, SignatureError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// The encryption public key is not loaded yet.
    #[error("Operator is not ready")]
    OperatorNotReady,

    #[error("Invalid deposit: {0}")]
    InvalidDeposit(String),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Deal(#[from] DealError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Compute(#[from] SecretComputeError),
}

/// Result of one coordination cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The operator is not active.
    Inactive,
    /// The settlement window is still this many blocks away.
    Waiting(i64),
    /// A deal was created and executed.
    DealExecuted(Deal),
    /// The window elapsed without enough deposits.
    QuorumNotReached,
}

/// Lifecycle state of the operator.
#[derive(Debug, Default)]
struct OperatorState {
    active: bool,
    last_countdown: Option<i64>,
}

impl OperatorState {
    fn activate(&mut self) {
        self.active = true;
    }

    fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Configuration as served to clients.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub sc_addr: String,
    pub salad_addr: String,
    pub enigma_addr: String,
    pub enigma_token_addr: String,
    pub pub_key_data: Option<PubKeyBundle>,
}

/// The operator coordinator.
pub struct OperatorCoordinator {
    deal_manager: Arc<DealManager>,
    store: Arc<dyn LedgerStore>,
    ledger: Arc<dyn LedgerContract>,
    compute: Arc<SecretComputeClient>,
    deployment: DeploymentAddrs,

    /// Deposits needed to form a deal.
    threshold: usize,
    poll_interval: Duration,
    retry: RetryPolicy,

    state: RwLock<OperatorState>,

    /// Serializes durable changes with the events reporting them.
    commit_lock: Mutex<()>,
    events: broadcast::Sender<OperatorEvent>,
}

impl OperatorCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deal_manager: Arc<DealManager>,
        store: Arc<dyn LedgerStore>,
        ledger: Arc<dyn LedgerContract>,
        compute: Arc<SecretComputeClient>,
        deployment: DeploymentAddrs,
        threshold: usize,
        poll_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            deal_manager,
            store,
            ledger,
            compute,
            deployment,
            threshold,
            poll_interval,
            retry,
            state: RwLock::new(OperatorState::default()),
            commit_lock: Mutex::new(()),
            events,
        }
    }

    /// Subscribe to operator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OperatorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: OperatorEvent) {
        debug!("Event: {}", event.action());
        // No subscriber is not an error
        let _ = self.events.send(event);
    }

    pub async fn is_active(&self) -> bool {
        self.state.read().await.active
    }

    /// Last countdown computed by the settlement loop.
    pub async fn last_countdown(&self) -> Option<i64> {
        self.state.read().await.last_countdown
    }

    // ==========================================
    // LIFECYCLE
    // ==========================================

    /// Load the encryption public key (fetching it on first start) and
    /// start accepting deposits.
    pub async fn activate(&self) -> Result<(), OperatorError> {
        info!("Activating operator...");
        let bundle = self
            .retry
            .run("Public key bundle fetch", || self.compute.get_or_fetch_public_key_bundle())
            .await?;
        self.emit(OperatorEvent::PubKeyReady(bundle));

        if self.store.get_last_mix_block().await?.is_none() {
            let block = self.deal_manager.update_last_mix_block().await?;
            info!("First start: lastMixBlock initialized to {}", block);
        }

        self.state.write().await.activate();
        info!("Operator active (threshold {})", self.threshold);
        Ok(())
    }

    /// Finish deals a previous run left in `Created` or `Executing`.
    pub async fn recover_pending_deals(&self) -> Result<usize, OperatorError> {
        let pending = self.deal_manager.pending_deals().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        info!("Recovering {} unfinished deals", pending.len());
        for deal in &pending {
            // Created deals were never announced; their publication may be
            // mid-flight with a recorded transaction
            let announced = deal.status != DealStatus::Created;
            let deal = self.publish_with_retry(deal).await?;
            if !announced {
                self.emit(OperatorEvent::DealCreated(deal.clone()));
            }
            self.execute_with_retry(&deal).await?;
        }
        Ok(pending.len())
    }

    /// Stop the settlement loop and release the store. Remote tasks in
    /// flight are not cancelled.
    pub async fn shutdown(&self) {
        info!("Shutting down operator...");
        self.state.write().await.deactivate();
        self.store.close().await;
    }

    /// Run coordination cycles until the operator is deactivated.
    pub async fn run(&self) {
        info!("Settlement loop started (poll interval {:?})", self.poll_interval);
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.run_cycle().await {
                Ok(CycleOutcome::Inactive) => break,
                Ok(outcome) => debug!("Cycle finished: {:?}", outcome),
                Err(e) => error!("Settlement cycle failed: {}", e),
            }
        }
        info!("Settlement loop stopped");
    }

    /// One coordination cycle: countdown, then settlement when due.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, OperatorError> {
        if !self.is_active().await {
            return Ok(CycleOutcome::Inactive);
        }

        let countdown = self.deal_manager.blocks_until_mix().await?;
        self.state.write().await.last_countdown = Some(countdown);
        self.emit(OperatorEvent::BlockCountdown(countdown));

        if countdown > 0 {
            return Ok(CycleOutcome::Waiting(countdown));
        }
        self.settle().await
    }

    async fn settle(&self) -> Result<CycleOutcome, OperatorError> {
        loop {
            match self.try_settle().await {
                Err(OperatorError::Deal(e)) if e.is_assignment_mismatch() => {
                    warn!("Deposit set changed during settlement, starting over: {}", e);
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_settle(&self) -> Result<CycleOutcome, OperatorError> {
        let funded = self.deal_manager.screen_fillable_deposits(0).await?;
        debug!("{} funded fillable deposits", funded.len());
        let context = self.deal_manager.reservation_context().await?;

        let reserved = {
            let _guard = self.commit_lock.lock().await;
            let fillable = self.deal_manager.balance_fillable_deposits(0).await?;

            match select_deal_candidates(&fillable, self.threshold) {
                Some((amount, candidates)) => {
                    info!("Quorum reached: {} deposits of {}", candidates.len(), amount);
                    let deal = self
                        .deal_manager
                        .reserve_deal(amount, &candidates, context)
                        .await?;
                    // Events follow commit order: the quorum drops when the
                    // deposits are assigned, DealCreated once newDeal is mined
                    self.emit(OperatorEvent::QuorumUpdated(fillable.len() - candidates.len()));
                    Some(deal)
                }
                None => None,
            }
        };

        match reserved {
            Some(deal) => {
                let deal = self.publish_with_retry(&deal).await?;
                self.emit(OperatorEvent::DealCreated(deal.clone()));
                let executed = self.execute_with_retry(&deal).await?;
                Ok(CycleOutcome::DealExecuted(executed))
            }
            None => {
                info!("Quorum not reached, skipping deal creation");
                self.deal_manager.update_last_mix_block().await?;

                let fillable = self.deal_manager.balance_fillable_deposits(0).await?;
                let amount = select_deal_candidates(&fillable, 1).map_or(0, |(amount, _)| amount);
                self.retry
                    .run("Deposit verification", || {
                        self.deal_manager.verify_deposits(amount, &fillable)
                    })
                    .await?;

                self.emit(OperatorEvent::QuorumNotReached);
                Ok(CycleOutcome::QuorumNotReached)
            }
        }
    }

    async fn publish_with_retry(&self, deal: &Deal) -> Result<Deal, OperatorError> {
        Ok(self
            .retry
            .run("Deal publication", || self.deal_manager.publish_deal(deal))
            .await?)
    }

    async fn execute_with_retry(&self, deal: &Deal) -> Result<Deal, OperatorError> {
        let executed = self
            .retry
            .run("Deal execution", || self.deal_manager.execute_deal(deal))
            .await?;
        self.emit(OperatorEvent::DealExecuted(executed.clone()));
        Ok(executed)
    }

    // ==========================================
    // DEPOSITOR OPERATIONS
    // ==========================================

    /// Verify, register and announce a deposit.
    pub async fn submit_deposit_metadata(&self, deposit: NewDeposit) -> Result<Deposit, OperatorError> {
        if !self.is_active().await {
            return Err(OperatorError::OperatorNotReady);
        }
        if deposit.amount == 0 {
            return Err(OperatorError::InvalidDeposit("amount must be positive".to_string()));
        }

        let chain_id = self.ledger.chain_id().await?;
        let payload = DepositPayload {
            sender: deposit.sender.clone(),
            amount: deposit.amount,
            enc_recipient: deposit.enc_recipient.clone(),
            pub_key: deposit.pub_key.clone(),
        };
        let deposit = NewDeposit {
            sender: signature::verify(&payload, &deposit.signature, chain_id)?,
            ..deposit
        };
        self.deal_manager.check_balance(&deposit).await?;

        let _guard = self.commit_lock.lock().await;
        let stored = self.deal_manager.record_deposit(deposit).await?;
        let quorum = self.deal_manager.balance_fillable_deposits(0).await?.len();
        self.emit(OperatorEvent::QuorumUpdated(quorum));

        info!("Deposit accepted from {} (quorum {})", stored.sender, quorum);
        Ok(stored)
    }

    pub async fn fetch_config(&self) -> Result<OperatorConfig, OperatorError> {
        Ok(OperatorConfig {
            sc_addr: self.deployment.secret_contract.clone(),
            salad_addr: self.deployment.salad_contract.clone(),
            enigma_addr: self.deployment.enigma_contract.clone(),
            enigma_token_addr: self.deployment.enigma_token_contract.clone(),
            pub_key_data: self.store.get_pub_key_bundle().await?,
        })
    }

    pub fn get_threshold(&self) -> usize {
        self.threshold
    }

    /// Number of fillable deposits of at least `min_amount`.
    pub async fn get_quorum(&self, min_amount: u128) -> Result<usize, OperatorError> {
        Ok(self.deal_manager.balance_fillable_deposits(min_amount).await?.len())
    }

    pub async fn fetch_fillable_deposits(&self, min_amount: u128) -> Result<Vec<Deposit>, OperatorError> {
        Ok(self.deal_manager.balance_fillable_deposits(min_amount).await?)
    }

    /// Deals, optionally filtered by status.
    pub async fn fetch_deals(&self, status: Option<DealStatus>) -> Result<Vec<Deal>, OperatorError> {
        Ok(self.store.query_deals(status).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::TaskStatus;
    use crate::db::MemoryStore;
    use crate::services::signature::tests::{account, sign_payload};
    use crate::testing::Harness;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast::error::TryRecvError;

    /// Store whose first assignment loses a race: the deposit of
    /// `withdrawn` is discarded right before the assignment runs.
    struct RacingAssignStore {
        inner: Arc<MemoryStore>,
        withdrawn: String,
        raced: AtomicBool,
    }

    #[async_trait]
    impl LedgerStore for RacingAssignStore {
        async fn insert_deposit(&self, deposit: NewDeposit) -> Result<Deposit, StoreError> {
            self.inner.insert_deposit(deposit).await
        }

        async fn discard_deposit(&self, sender: &str) -> Result<bool, StoreError> {
            self.inner.discard_deposit(sender).await
        }

        async fn query_fillable_deposits(&self, min_amount: u128) -> Result<Vec<Deposit>, StoreError> {
            self.inner.query_fillable_deposits(min_amount).await
        }

        async fn assign_deposits(&self, deal_id: &str, senders: &[String]) -> Result<(), StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.discard_deposit(&self.withdrawn).await?;
            }
            self.inner.assign_deposits(deal_id, senders).await
        }

        async fn insert_deal(&self, deal: &Deal) -> Result<(), StoreError> {
            self.inner.insert_deal(deal).await
        }

        async fn update_deal(&self, deal: &Deal) -> Result<(), StoreError> {
            self.inner.update_deal(deal).await
        }

        async fn get_deal(&self, deal_id: &str) -> Result<Option<Deal>, StoreError> {
            self.inner.get_deal(deal_id).await
        }

        async fn query_deals(&self, status: Option<DealStatus>) -> Result<Vec<Deal>, StoreError> {
            self.inner.query_deals(status).await
        }

        async fn get_deal_deposits(&self, deal_id: &str) -> Result<Vec<Deposit>, StoreError> {
            self.inner.get_deal_deposits(deal_id).await
        }

        async fn get_cache(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
            self.inner.get_cache(key).await
        }

        async fn set_cache(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
            self.inner.set_cache(key, value).await
        }

        async fn truncate(&self) -> Result<(), StoreError> {
            self.inner.truncate().await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    fn signed_deposit(seed: u8, amount: u128) -> NewDeposit {
        let (secret, sender) = account(seed);
        let payload = DepositPayload {
            sender: sender.clone(),
            amount,
            enc_recipient: format!("0xe0{:02x}", seed),
            pub_key: format!("0x04{:02x}", seed),
        };
        let signature = sign_payload(&secret, &payload, 1);
        NewDeposit {
            sender,
            amount,
            pub_key: payload.pub_key,
            enc_recipient: payload.enc_recipient,
            signature,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<OperatorEvent>) -> Vec<OperatorEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    async fn active(h: &Harness) -> broadcast::Receiver<OperatorEvent> {
        h.coordinator.activate().await.unwrap();
        h.coordinator.subscribe()
    }

    #[tokio::test]
    async fn test_deposits_rejected_before_activation() {
        let h = Harness::new();
        let err = h
            .coordinator
            .submit_deposit_metadata(signed_deposit(1, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::OperatorNotReady));
        assert_eq!(h.coordinator.run_cycle().await.unwrap(), CycleOutcome::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_loads_key_and_initializes_window() {
        let h = Harness::new();
        h.ledger.set_block(12);
        let mut rx = h.coordinator.subscribe();

        h.coordinator.activate().await.unwrap();

        assert!(h.coordinator.is_active().await);
        assert_eq!(h.store.get_last_mix_block().await.unwrap(), Some(12));
        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [OperatorEvent::PubKeyReady(_)]));

        let config = h.coordinator.fetch_config().await.unwrap();
        assert!(config.pub_key_data.is_some());
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["scAddr"].is_string());
        assert!(json["pubKeyData"]["workerPubKey"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_broadcasts_quorum() {
        let h = Harness::new();
        let mut rx = active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10)]);

        h.coordinator.submit_deposit_metadata(signed_deposit(1, 10)).await.unwrap();
        h.coordinator.submit_deposit_metadata(signed_deposit(2, 10)).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![OperatorEvent::QuorumUpdated(1), OperatorEvent::QuorumUpdated(2)]
        );
        assert_eq!(h.coordinator.get_quorum(0).await.unwrap(), 2);
        assert_eq!(h.coordinator.get_quorum(11).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_signature_is_not_persisted() {
        let h = Harness::new();
        let mut rx = active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10)]);

        // Signed by account 1, claimed by account 2
        let mut forged = signed_deposit(1, 10);
        forged.sender = account(2).1;

        let err = h.coordinator.submit_deposit_metadata(forged).await.unwrap_err();
        assert!(matches!(
            err,
            OperatorError::Signature(SignatureError::SignatureMismatch { .. })
        ));
        assert_eq!(h.coordinator.get_quorum(0).await.unwrap(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfunded_deposit_rejected() {
        let h = Harness::new();
        active(&h).await;
        h.fund_accounts(&[(1, 5)]);

        let err = h
            .coordinator
            .submit_deposit_metadata(signed_deposit(1, 10))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperatorError::Deal(DealError::InsufficientBalance { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_waits_for_window() {
        let h = Harness::new();
        h.ledger.set_block(100);
        let mut rx = active(&h).await;

        h.ledger.set_block(102);
        assert_eq!(h.coordinator.run_cycle().await.unwrap(), CycleOutcome::Waiting(3));
        assert_eq!(drain(&mut rx), vec![OperatorEvent::BlockCountdown(3)]);
        assert_eq!(h.coordinator.last_countdown().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_creates_and_executes_deal() {
        let h = Harness::new();
        h.ledger.set_block(100);
        let mut rx = active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10)]);
        let first = h.coordinator.submit_deposit_metadata(signed_deposit(1, 10)).await.unwrap();
        let second = h.coordinator.submit_deposit_metadata(signed_deposit(2, 10)).await.unwrap();
        drain(&mut rx);

        h.ledger.set_block(105);
        let outcome = h.coordinator.run_cycle().await.unwrap();

        let CycleOutcome::DealExecuted(deal) = outcome else {
            panic!("expected an executed deal");
        };
        assert_eq!(deal.participants, vec![first.sender, second.sender]);
        assert_eq!(deal.status, DealStatus::Executed);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], OperatorEvent::BlockCountdown(0));
        assert_eq!(events[1], OperatorEvent::QuorumUpdated(0));
        assert!(matches!(&events[2], OperatorEvent::DealCreated(d) if d.deal_id == deal.deal_id));
        assert!(matches!(&events[3], OperatorEvent::DealExecuted(d) if d.deal_id == deal.deal_id));

        assert_eq!(h.coordinator.get_quorum(0).await.unwrap(), 0);
        assert_eq!(h.store.get_last_mix_block().await.unwrap(), Some(105));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quorum_not_reached_verifies_deposits() {
        let h = Harness::new();
        h.ledger.set_block(100);
        let mut rx = active(&h).await;
        h.fund_accounts(&[(1, 10)]);
        h.coordinator.submit_deposit_metadata(signed_deposit(1, 10)).await.unwrap();
        drain(&mut rx);

        h.ledger.set_block(107);
        assert_eq!(h.coordinator.run_cycle().await.unwrap(), CycleOutcome::QuorumNotReached);

        assert_eq!(
            drain(&mut rx),
            vec![OperatorEvent::BlockCountdown(-2), OperatorEvent::QuorumNotReached]
        );
        assert_eq!(h.store.get_last_mix_block().await.unwrap(), Some(107));
        assert!(h.ledger.new_deal_calls().is_empty());
        let verify = h.compute.requests().pop().unwrap();
        assert!(verify.task_fn.starts_with("verify_deposits"));
        assert_eq!(h.coordinator.get_quorum(0).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_execution_is_retried_once_announced() {
        let h = Harness::new();
        h.ledger.set_block(100);
        let mut rx = active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10)]);
        h.coordinator.submit_deposit_metadata(signed_deposit(1, 10)).await.unwrap();
        h.coordinator.submit_deposit_metadata(signed_deposit(2, 10)).await.unwrap();
        drain(&mut rx);

        let submitted_before = h.compute.requests().len();
        // The failed task is polled once more before it is replaced
        h.compute.script_statuses(vec![TaskStatus::Failed, TaskStatus::Failed]);
        h.ledger.set_block(105);
        let outcome = h.coordinator.run_cycle().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::DealExecuted(_)));

        let executed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, OperatorEvent::DealExecuted(_)))
            .collect();
        assert_eq!(executed.len(), 1);
        assert_eq!(h.compute.requests().len() - submitted_before, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publication_is_retried() {
        let h = Harness::new();
        h.ledger.set_block(100);
        active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10)]);
        h.coordinator.submit_deposit_metadata(signed_deposit(1, 10)).await.unwrap();
        h.coordinator.submit_deposit_metadata(signed_deposit(2, 10)).await.unwrap();

        h.ledger.fail_new_deal(2);
        h.ledger.set_block(105);
        let outcome = h.coordinator.run_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::DealExecuted(_)));
        assert_eq!(h.ledger.new_deal_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_receipt_is_awaited_not_resent() {
        let h = Harness::new();
        h.ledger.set_block(100);
        active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10)]);
        h.coordinator.submit_deposit_metadata(signed_deposit(1, 10)).await.unwrap();
        h.coordinator.submit_deposit_metadata(signed_deposit(2, 10)).await.unwrap();

        h.ledger.time_out_receipts(2);
        h.ledger.set_block(105);
        let outcome = h.coordinator.run_cycle().await.unwrap();

        assert!(matches!(outcome, CycleOutcome::DealExecuted(_)));
        assert_eq!(h.ledger.sent_new_deals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assignment_race_restarts_with_fresh_deposits() {
        let withdrawn = account(3).1;
        let h = Harness::with_store(|memory| {
            Arc::new(RacingAssignStore {
                inner: memory,
                withdrawn: withdrawn.clone(),
                raced: AtomicBool::new(false),
            }) as Arc<dyn LedgerStore>
        });
        h.ledger.set_block(100);
        let mut rx = active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10), (3, 10)]);
        for seed in 1..=3 {
            h.coordinator.submit_deposit_metadata(signed_deposit(seed, 10)).await.unwrap();
        }
        drain(&mut rx);

        h.ledger.set_block(105);
        let CycleOutcome::DealExecuted(deal) = h.coordinator.run_cycle().await.unwrap() else {
            panic!("expected an executed deal");
        };
        assert_eq!(deal.participants, vec![account(1).1, account(2).1]);

        // The first reservation is left failed and holds no deposits
        let failed = h.store.query_deals(Some(DealStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].participants.len(), 3);
        assert!(h.store.get_deal_deposits(&failed[0].deal_id).await.unwrap().is_empty());
        assert_eq!(h.ledger.new_deal_calls().len(), 1);

        let quorum_updates: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, OperatorEvent::QuorumUpdated(_)))
            .collect();
        assert_eq!(quorum_updates, vec![OperatorEvent::QuorumUpdated(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deposit_submitted_during_publication_waits_for_next_deal() {
        let h = Harness::new();
        h.ledger.set_block(100);
        let mut rx = active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10), (3, 10), (4, 10)]);
        h.coordinator.submit_deposit_metadata(signed_deposit(1, 10)).await.unwrap();
        h.coordinator.submit_deposit_metadata(signed_deposit(2, 10)).await.unwrap();
        drain(&mut rx);

        // A late receipt parks the cycle in its publication retry pause
        h.ledger.time_out_receipts(1);
        h.ledger.set_block(105);
        let coordinator = h.coordinator.clone();
        let cycle = tokio::spawn(async move { coordinator.run_cycle().await });
        while h.ledger.sent_new_deals() == 0 {
            tokio::task::yield_now().await;
        }

        let late = h.coordinator.submit_deposit_metadata(signed_deposit(3, 10)).await.unwrap();
        assert!(!cycle.is_finished());

        let CycleOutcome::DealExecuted(first) = cycle.await.unwrap().unwrap() else {
            panic!("expected an executed deal");
        };
        assert_eq!(first.participants, vec![account(1).1, account(2).1]);
        assert_eq!(h.ledger.sent_new_deals(), 1);
        let fillable: Vec<i64> = h
            .coordinator
            .fetch_fillable_deposits(0)
            .await
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(fillable, vec![late.id]);

        let events = drain(&mut rx);
        assert_eq!(
            events[..3],
            [
                OperatorEvent::BlockCountdown(0),
                OperatorEvent::QuorumUpdated(0),
                OperatorEvent::QuorumUpdated(1),
            ]
        );
        assert!(matches!(&events[3], OperatorEvent::DealCreated(d) if d.deal_id == first.deal_id));

        // The next window picks the late deposit up
        h.coordinator.submit_deposit_metadata(signed_deposit(4, 10)).await.unwrap();
        h.ledger.set_block(110);
        let CycleOutcome::DealExecuted(second) = h.coordinator.run_cycle().await.unwrap() else {
            panic!("expected an executed deal");
        };
        assert_eq!(second.participants, vec![account(3).1, account(4).1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_elapsed_window_settles_exactly_once() {
        let h = Harness::new();
        h.ledger.set_block(100);
        let mut rx = active(&h).await;

        for block in [105, 106, 110, 111, 115] {
            h.ledger.set_block(block);
            h.coordinator.run_cycle().await.unwrap();
        }

        let settlements = drain(&mut rx)
            .into_iter()
            .filter(|e| {
                matches!(e, OperatorEvent::QuorumNotReached | OperatorEvent::DealCreated(_))
            })
            .count();
        assert_eq!(settlements, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawn_deposit_is_screened_out() {
        let h = Harness::new();
        h.ledger.set_block(100);
        active(&h).await;
        h.fund_accounts(&[(1, 10), (2, 10), (3, 10)]);
        for seed in 1..=3 {
            h.coordinator.submit_deposit_metadata(signed_deposit(seed, 10)).await.unwrap();
        }
        h.fund_accounts(&[(3, 0)]);

        h.ledger.set_block(105);
        let CycleOutcome::DealExecuted(deal) = h.coordinator.run_cycle().await.unwrap() else {
            panic!("expected an executed deal");
        };
        assert_eq!(deal.participants, vec![account(1).1, account(2).1]);
        assert_eq!(h.coordinator.get_quorum(0).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_finishes_unpublished_deal() {
        let h = Harness::new();
        h.fund_and_register(&[(1, 10), (2, 10)]).await;
        let deposits = h.store.query_fillable_deposits(0).await.unwrap();
        let context = h.manager.reservation_context().await.unwrap();
        let reserved = h.manager.reserve_deal(10, &deposits, context).await.unwrap();

        let mut rx = active(&h).await;
        assert_eq!(h.coordinator.recover_pending_deals().await.unwrap(), 1);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], OperatorEvent::DealCreated(d) if d.deal_id == reserved.deal_id));
        assert!(matches!(&events[1], OperatorEvent::DealExecuted(_)));
        assert_eq!(h.ledger.new_deal_calls().len(), 1);
        assert_eq!(h.coordinator.recover_pending_deals().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_confirms_recorded_transaction() {
        let h = Harness::new();
        h.fund_and_register(&[(1, 10), (2, 10)]).await;
        let deposits = h.store.query_fillable_deposits(0).await.unwrap();
        let context = h.manager.reservation_context().await.unwrap();
        let reserved = h.manager.reserve_deal(10, &deposits, context).await.unwrap();

        // Sent before the crash, receipt not seen yet
        h.ledger.time_out_receipts(1);
        assert!(h.manager.publish_deal(&reserved).await.is_err());

        let mut rx = active(&h).await;
        assert_eq!(h.coordinator.recover_pending_deals().await.unwrap(), 1);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], OperatorEvent::DealCreated(d) if d.tx_hash.is_some()));
        assert!(matches!(&events[1], OperatorEvent::DealExecuted(_)));
        assert_eq!(h.ledger.sent_new_deals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_awaits_recorded_execute_task() {
        let h = Harness::new();
        h.fund_and_register(&[(1, 10), (2, 10)]).await;
        let deposits = h.store.query_fillable_deposits(0).await.unwrap();
        let context = h.manager.reservation_context().await.unwrap();
        let reserved = h.manager.reserve_deal(10, &deposits, context).await.unwrap();
        let mut deal = h.manager.publish_deal(&reserved).await.unwrap();

        // A previous run submitted the task and stopped before it confirmed
        let task = h.client.execute_deal(10, &deposits, deal.nonce, 1).await.unwrap();
        deal.status = DealStatus::Executing;
        deal.task_id = Some(task.task_id.clone());
        h.store.update_deal(&deal).await.unwrap();

        let mut rx = active(&h).await;
        let submitted = h.compute.requests().len();
        assert_eq!(h.coordinator.recover_pending_deals().await.unwrap(), 1);

        assert_eq!(h.compute.requests().len(), submitted);
        let executed = h.store.query_deals(Some(DealStatus::Executed)).await.unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].task_id, Some(task.task_id));

        let events = drain(&mut rx);
        assert!(matches!(events.as_slice(), [OperatorEvent::DealExecuted(d)] if d.deal_id == deal.deal_id));
        assert_eq!(h.ledger.sent_new_deals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_cycles() {
        let h = Harness::new();
        active(&h).await;
        h.coordinator.shutdown().await;

        assert!(!h.coordinator.is_active().await);
        assert_eq!(h.coordinator.run_cycle().await.unwrap(), CycleOutcome::Inactive);
        assert!(matches!(
            h.store.query_deals(None).await,
            Err(StoreError::Closed)
        ));
    }
}
