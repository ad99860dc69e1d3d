//! # Secret Computation Client
//!
//! Runs functions of the secret contract on the confidential network and
//! reads their sealed outputs.
//!
//! ## Task Lifecycle
//!
//! ```text
//! submit_task ──> Pending ──(poll)──> Confirmed ──> fetch_result (decrypt)
//!                    │
//!                    └──────────────> Failed ──> RemoteTaskFailed
//! ```
//!
//! A task cannot be cancelled. Submission is never retried here since each
//! call is paid for.
//!
//! ## Key Handling
//!
//! Every task is sealed for the current key pair of the [`TaskKeyRing`].
//! The `get_pub_key()` disclosure hands its private key to clients inside
//! the bundle, so that pair is consumed before the request and the ring is
//! rotated as soon as the bundle is extracted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::compute::keys::{TaskKeyPair, TaskKeyRing};
use crate::compute::{ComputeError, ComputeTransport, TaskArg, TaskRequest, TaskStatus};
use crate::config::GasConfig;
use crate::db::{Deposit, LedgerStore, PubKeyBundle, StoreError};
use crate::utils::{decode_hex, encode_hex_prefixed};

const GET_PUB_KEY_FN: &str = "get_pub_key()";
const EXECUTE_DEAL_FN: &str =
    "execute_deal(address,uint256,uint256,bytes[],bytes[],address[],bytes[],uint256)";
const VERIFY_DEPOSITS_FN: &str = "verify_deposits(uint256,bytes[],bytes[],address[],bytes[],uint256)";

/// Errors of the secret computation client.
#[derive(Debug, thiserror::Error)]
pub enum SecretComputeError {
    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Gas paid for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasOpts {
    pub gas_limit: u64,
    pub gas_price: u64,
}

/// A submitted task and the key pair its output is sealed for.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub task_fn: String,
    pub status: TaskStatus,
    key: TaskKeyPair,
}

/// Output of a confirmed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    /// Sealed output as returned by the network (`0x` hex).
    pub encrypted_output: String,
    pub decrypted_output: Vec<u8>,
    pub worker_pub_key: String,
}

/// Client for the secret contract on the confidential network.
pub struct SecretComputeClient {
    transport: Arc<dyn ComputeTransport>,
    store: Arc<dyn LedgerStore>,
    keys: Mutex<TaskKeyRing>,

    /// Account the tasks are sent from.
    operator_address: String,

    /// Secret contract address.
    contract_address: String,

    poll_interval: Duration,
    gas: GasConfig,
}

impl SecretComputeClient {
    pub fn new(
        transport: Arc<dyn ComputeTransport>,
        store: Arc<dyn LedgerStore>,
        operator_address: &str,
        contract_address: &str,
        poll_interval: Duration,
        gas: GasConfig,
    ) -> Self {
        info!("Secret computation client initialized:");
        info!("  Secret contract: {}", contract_address);
        info!("  Status poll interval: {:?}", poll_interval);

        Self {
            transport,
            store,
            keys: Mutex::new(TaskKeyRing::new()),
            operator_address: operator_address.to_string(),
            contract_address: contract_address.to_string(),
            poll_interval,
            gas,
        }
    }

    /// Gas for a deal task over `participants` deposits.
    pub fn deal_gas(&self, participants: usize) -> GasOpts {
        let per_participant = self
            .gas
            .deal_participant_gas
            .saturating_mul(participants.max(1) as u64);
        GasOpts {
            gas_limit: self.gas.deal_base_gas.saturating_add(per_participant),
            gas_price: self.gas.task_gas_price,
        }
    }

    fn pub_key_gas(&self) -> GasOpts {
        GasOpts {
            gas_limit: self.gas.pub_key_gas_limit,
            gas_price: self.gas.task_gas_price,
        }
    }

    /// Submit `task_fn` sealed for the current key pair.
    pub async fn submit_task(
        &self,
        task_fn: &str,
        args: &[TaskArg],
        gas: GasOpts,
    ) -> Result<Task, SecretComputeError> {
        let key = self.keys.lock().await.acquire().clone();
        self.submit_with_key(task_fn, args, gas, key).await
    }

    async fn submit_with_key(
        &self,
        task_fn: &str,
        args: &[TaskArg],
        gas: GasOpts,
        key: TaskKeyPair,
    ) -> Result<Task, SecretComputeError> {
        let request = TaskRequest {
            task_fn: task_fn.to_string(),
            task_args: args.iter().map(TaskArg::to_json).collect(),
            gas_limit: gas.gas_limit,
            gas_price: gas.gas_price,
            sender: self.operator_address.clone(),
            contract_address: self.contract_address.clone(),
            user_pub_key: key.public_key_hex(),
        };

        let task_id = self.transport.submit_task(&request).await?;
        info!("Task submitted: {} ({}, gas limit {})", task_id, task_fn, gas.gas_limit);

        Ok(Task {
            task_id,
            task_fn: task_fn.to_string(),
            status: TaskStatus::Pending,
            key,
        })
    }

    /// Poll a task by id until it leaves `Pending`. There is no timeout.
    ///
    /// Works for tasks submitted before a restart, whose key pair is gone.
    pub async fn await_task(&self, task_id: &str) -> Result<TaskStatus, SecretComputeError> {
        loop {
            match self.transport.task_status(task_id).await? {
                TaskStatus::Pending => {
                    debug!("Task {} pending", task_id);
                    tokio::time::sleep(self.poll_interval).await;
                }
                status => return Ok(status),
            }
        }
    }

    /// Wait for `task` and fail with `RemoteTaskFailed` unless it confirms.
    pub async fn await_completion(&self, mut task: Task) -> Result<Task, SecretComputeError> {
        task.status = self.await_task(&task.task_id).await?;
        if task.status != TaskStatus::Confirmed {
            return Err(ComputeError::RemoteTaskFailed(task.task_id).into());
        }
        info!("Task {} confirmed", task.task_id);
        Ok(task)
    }

    /// Read and decrypt the output of a confirmed task.
    pub async fn fetch_result(&self, task: &Task) -> Result<TaskResult, SecretComputeError> {
        if task.status != TaskStatus::Confirmed {
            return Err(ComputeError::IllegalTaskState {
                task_id: task.task_id.clone(),
                status: task.status,
            }
            .into());
        }

        let output = self.transport.task_output(&task.task_id).await?;
        let blob = decode_hex(&output.encrypted_output).map_err(ComputeError::InvalidResponse)?;
        let decrypted_output = task.key.decrypt(&output.worker_encryption_key, &blob)?;

        Ok(TaskResult {
            encrypted_output: output.encrypted_output,
            decrypted_output,
            worker_pub_key: output.worker_encryption_key,
        })
    }

    /// Wait for `task` and return its decrypted output.
    pub async fn complete(&self, task: Task) -> Result<TaskResult, SecretComputeError> {
        let task = self.await_completion(task).await?;
        self.fetch_result(&task).await
    }

    /// The network's encryption public key bundle, fetched once and then
    /// served from the store.
    pub async fn get_or_fetch_public_key_bundle(&self) -> Result<PubKeyBundle, SecretComputeError> {
        if let Some(bundle) = self.store.get_pub_key_bundle().await? {
            debug!("Public key bundle served from cache");
            return Ok(bundle);
        }

        info!("No cached public key bundle, requesting {}", GET_PUB_KEY_FN);
        let key = {
            let mut ring = self.keys.lock().await;
            let key = ring.acquire().clone();
            ring.consume();
            key
        };

        let task = self
            .submit_with_key(GET_PUB_KEY_FN, &[], self.pub_key_gas(), key.clone())
            .await?;
        let task_id = task.task_id.clone();
        let result = self.complete(task).await?;

        let bundle = PubKeyBundle {
            task_id,
            encrypted_output: result.encrypted_output,
            user_private_key: key.private_key_hex(),
            worker_pub_key: result.worker_pub_key,
        };
        self.store.set_pub_key_bundle(&bundle).await?;
        self.keys.lock().await.rotate();

        info!("Public key bundle stored (task {})", bundle.task_id);
        Ok(bundle)
    }

    /// Submit the `execute_deal` task for `deposits`. Use [`complete`](Self::complete)
    /// to wait for it.
    pub async fn execute_deal(
        &self,
        amount: u128,
        deposits: &[Deposit],
        nonce: u64,
        chain_id: u64,
    ) -> Result<Task, SecretComputeError> {
        let mut args = vec![
            TaskArg::Address(self.operator_address.clone()),
            TaskArg::Uint(nonce as u128),
            TaskArg::Uint(amount),
        ];
        args.extend(deposit_arrays(deposits));
        args.push(TaskArg::Uint(chain_id as u128));

        self.submit_task(EXECUTE_DEAL_FN, &args, self.deal_gas(deposits.len()))
            .await
    }

    /// Have the network check `deposits` and wait for the verdict.
    pub async fn verify_deposits(
        &self,
        amount: u128,
        deposits: &[Deposit],
        chain_id: u64,
    ) -> Result<TaskResult, SecretComputeError> {
        let mut args = vec![TaskArg::Uint(amount)];
        args.extend(deposit_arrays(deposits));
        args.push(TaskArg::Uint(chain_id as u128));

        let task = self
            .submit_task(VERIFY_DEPOSITS_FN, &args, self.deal_gas(deposits.len()))
            .await?;
        self.complete(task).await
    }

    #[cfg(test)]
    pub(crate) async fn key_generation(&self) -> u64 {
        self.keys.lock().await.generation()
    }
}

/// Parallel arrays: public keys, encrypted recipients, senders, signatures.
fn deposit_arrays(deposits: &[Deposit]) -> [TaskArg; 4] {
    let column = |field: fn(&Deposit) -> &str| -> Vec<String> {
        deposits.iter().map(|d| prefixed(field(d))).collect()
    };
    [
        TaskArg::BytesArray(column(|d| d.pub_key.as_str())),
        TaskArg::BytesArray(column(|d| d.enc_recipient.as_str())),
        TaskArg::AddressArray(deposits.iter().map(|d| d.sender.clone()).collect()),
        TaskArg::BytesArray(column(|d| d.signature.as_str())),
    ]
}

fn prefixed(value: &str) -> String {
    match decode_hex(value) {
        Ok(bytes) => encode_hex_prefixed(&bytes),
        Err(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::keys::{open, parse_public_key, shared_key};
    use crate::db::MemoryStore;
    use secp256k1::SecretKey;
    use crate::testing::{deposit, gas_config, FakeComputeTransport, OPERATOR};
    use serde_json::json;

    fn client(transport: Arc<FakeComputeTransport>, store: Arc<MemoryStore>) -> SecretComputeClient {
        SecretComputeClient::new(
            transport,
            store,
            OPERATOR,
            "0x00000000000000000000000000000000000000cc",
            Duration::from_secs(1),
            gas_config(),
        )
    }

    #[test]
    fn test_deal_gas_scales_with_participants() {
        let c = client(Arc::new(FakeComputeTransport::new()), Arc::new(MemoryStore::new()));
        assert_eq!(c.deal_gas(0).gas_limit, 5_000_000 + 100_000_000);
        assert_eq!(c.deal_gas(3).gas_limit, 5_000_000 + 300_000_000);
        assert_eq!(c.deal_gas(3).gas_price, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_and_cache_public_key_bundle() {
        let transport = Arc::new(FakeComputeTransport::new());
        transport.set_output(GET_PUB_KEY_FN, b"network public key".to_vec());
        let store = Arc::new(MemoryStore::new());
        let c = client(transport.clone(), store.clone());

        let bundle = c.get_or_fetch_public_key_bundle().await.unwrap();
        assert_eq!(store.get_pub_key_bundle().await.unwrap(), Some(bundle.clone()));
        assert_eq!(c.key_generation().await, 1);

        // The disclosed private key opens the stored output
        let secret = SecretKey::from_slice(&decode_hex(&bundle.user_private_key).unwrap()).unwrap();
        let worker = parse_public_key(&bundle.worker_pub_key).unwrap();
        let blob = decode_hex(&bundle.encrypted_output).unwrap();
        assert_eq!(open(&shared_key(&secret, &worker), &blob).unwrap(), b"network public key");

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].gas_limit, 5_000_000);

        // Second call is served from the store
        let again = c.get_or_fetch_public_key_bundle().await.unwrap();
        assert_eq!(again, bundle);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disclosed_key_is_never_reused() {
        let transport = Arc::new(FakeComputeTransport::new());
        let c = client(transport.clone(), Arc::new(MemoryStore::new()));

        c.get_or_fetch_public_key_bundle().await.unwrap();
        c.execute_deal(10, &[deposit(1, "0x01", 10)], 0, 1).await.unwrap();

        let requests = transport.requests();
        assert_ne!(requests[0].user_pub_key, requests[1].user_pub_key);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_completion_polls_until_terminal() {
        let transport = Arc::new(FakeComputeTransport::new());
        transport.script_statuses(vec![TaskStatus::Pending, TaskStatus::Pending, TaskStatus::Confirmed]);
        transport.set_output(EXECUTE_DEAL_FN, b"done".to_vec());
        let c = client(transport.clone(), Arc::new(MemoryStore::new()));

        let task = c.execute_deal(10, &[deposit(1, "0x01", 10)], 3, 1).await.unwrap();
        let result = c.complete(task).await.unwrap();
        assert_eq!(result.decrypted_output, b"done");
        assert_eq!(transport.status_polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_is_reported() {
        let transport = Arc::new(FakeComputeTransport::new());
        transport.script_statuses(vec![TaskStatus::Pending, TaskStatus::Failed]);
        let c = client(transport, Arc::new(MemoryStore::new()));

        let task = c.submit_task(GET_PUB_KEY_FN, &[], c.pub_key_gas()).await.unwrap();
        let err = c.await_completion(task).await.unwrap_err();
        assert!(matches!(
            err,
            SecretComputeError::Compute(ComputeError::RemoteTaskFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_task_by_id_reports_terminal_status() {
        let transport = Arc::new(FakeComputeTransport::new());
        let c = client(transport.clone(), Arc::new(MemoryStore::new()));
        let task = c.execute_deal(10, &[deposit(1, "0x01", 10)], 0, 1).await.unwrap();

        transport.script_statuses(vec![TaskStatus::Pending, TaskStatus::Failed]);
        assert_eq!(c.await_task(&task.task_id).await.unwrap(), TaskStatus::Failed);
        assert_eq!(c.await_task(&task.task_id).await.unwrap(), TaskStatus::Confirmed);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_result_requires_confirmed_task() {
        let c = client(Arc::new(FakeComputeTransport::new()), Arc::new(MemoryStore::new()));
        let task = c.submit_task(GET_PUB_KEY_FN, &[], c.pub_key_gas()).await.unwrap();

        let err = c.fetch_result(&task).await.unwrap_err();
        assert!(matches!(
            err,
            SecretComputeError::Compute(ComputeError::IllegalTaskState {
                status: TaskStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_execute_deal_arguments() {
        let transport = Arc::new(FakeComputeTransport::new());
        let c = client(transport.clone(), Arc::new(MemoryStore::new()));
        let deposits = vec![deposit(1, "0x01", 10), deposit(2, "0x02", 10)];

        c.execute_deal(10, &deposits, 7, 42).await.unwrap();

        let request = &transport.requests()[0];
        assert_eq!(request.task_fn, EXECUTE_DEAL_FN);
        assert_eq!(request.gas_limit, 5_000_000 + 200_000_000);
        assert_eq!(request.arg(0), Some(&json!(OPERATOR)));
        assert_eq!(request.arg(1), Some(&json!("7")));
        assert_eq!(request.arg(2), Some(&json!("10")));
        assert_eq!(request.arg(3).unwrap().as_array().unwrap().len(), 2);
        assert!(request.arg(3).unwrap()[0].as_str().unwrap().starts_with("0x"));
        assert_eq!(request.arg(5), Some(&json!([deposits[0].sender, deposits[1].sender])));
        assert_eq!(request.arg(7), Some(&json!("42")));
    }

    #[tokio::test]
    async fn test_verify_deposits_arguments() {
        let transport = Arc::new(FakeComputeTransport::new());
        let c = client(transport.clone(), Arc::new(MemoryStore::new()));

        c.verify_deposits(10, &[deposit(1, "0x01", 10)], 1).await.unwrap();

        let request = &transport.requests()[0];
        assert_eq!(request.task_fn, VERIFY_DEPOSITS_FN);
        assert_eq!(request.task_args.len(), 6);
        assert_eq!(request.task_args[5], json!(["1", "uint256"]));
    }
}
