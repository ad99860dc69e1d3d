//! # Confidential Computation Network Module
//!
//! Transport for remote tasks: named functions of the secret contract,
//! executed by the confidential network and paid per call.
//!
//! ## Wire Protocol (JSON-RPC 2.0)
//!
//! | Method | Params | Result |
//! |--------|--------|--------|
//! | `task_submit` | `[TaskRequest]` | `{ "taskId": "0x..." }` |
//! | `task_getStatus` | `[taskId]` | `{ "status": 1 \| 2 \| 3 }` |
//! | `task_getResult` | `[taskId]` | `{ "encryptedOutput": "0x...", "workerEncryptionKey": "0x..." }` |
//!
//! Task arguments travel as `[value, "abiType"]` pairs.

pub mod keys;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::utils::json_rpc::{retry_rpc_operation, JsonRpcClient, RpcError};

/// Confidential network errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Compute RPC failed: {0}")]
    Rpc(#[from] RpcError),

    /// The network reported the task as failed.
    #[error("Remote task {0} failed")]
    RemoteTaskFailed(String),

    /// A result was requested for a task that is not confirmed.
    #[error("Illegal state to fetch results for task {task_id}: {status:?}")]
    IllegalTaskState { task_id: String, status: TaskStatus },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid compute response: {0}")]
    InvalidResponse(String),
}

/// Remote task status, as reported by `task_getStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TaskStatus {
    pub fn from_code(code: u8) -> Result<Self, ComputeError> {
        match code {
            1 => Ok(TaskStatus::Pending),
            2 => Ok(TaskStatus::Confirmed),
            3 => Ok(TaskStatus::Failed),
            other => Err(ComputeError::InvalidResponse(format!(
                "unknown task status code {}",
                other
            ))),
        }
    }
}

/// A typed task argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskArg {
    Address(String),
    Uint(u128),
    BytesArray(Vec<String>),
    AddressArray(Vec<String>),
}

impl TaskArg {
    pub fn abi_type(&self) -> &'static str {
        match self {
            TaskArg::Address(_) => "address",
            TaskArg::Uint(_) => "uint256",
            TaskArg::BytesArray(_) => "bytes[]",
            TaskArg::AddressArray(_) => "address[]",
        }
    }

    /// `[value, "abiType"]`. Integers are sent as decimal strings.
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            TaskArg::Address(address) => json!(address),
            TaskArg::Uint(n) => json!(n.to_string()),
            TaskArg::BytesArray(items) | TaskArg::AddressArray(items) => json!(items),
        };
        json!([value, self.abi_type()])
    }
}

/// A task as sent to `task_submit`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_fn: String,
    pub task_args: Vec<serde_json::Value>,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub sender: String,
    pub contract_address: String,
    /// Key the worker seals the output for.
    pub user_pub_key: String,
}

#[cfg(test)]
impl TaskRequest {
    /// Value of the argument at `index`.
    pub fn arg(&self, index: usize) -> Option<&serde_json::Value> {
        self.task_args.get(index).and_then(|pair| pair.get(0))
    }
}

/// Encrypted result of a confirmed task.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub encrypted_output: String,
    pub worker_encryption_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: u8,
}

/// Raw task operations of the confidential network.
#[async_trait]
pub trait ComputeTransport: Send + Sync {
    /// Submit a task. Returns its id.
    async fn submit_task(&self, request: &TaskRequest) -> Result<String, ComputeError>;

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, ComputeError>;

    async fn task_output(&self, task_id: &str) -> Result<TaskOutput, ComputeError>;
}

/// JSON-RPC implementation of [`ComputeTransport`].
pub struct RpcComputeTransport {
    rpc: JsonRpcClient,
}

impl RpcComputeTransport {
    pub fn new(url: &str) -> Result<Self, ComputeError> {
        let rpc = JsonRpcClient::new(url, Duration::from_secs(30))?;
        info!("Confidential network client initialized: {}", url);
        Ok(Self { rpc })
    }
}

#[async_trait]
impl ComputeTransport for RpcComputeTransport {
    async fn submit_task(&self, request: &TaskRequest) -> Result<String, ComputeError> {
        // Pay-per-call: never resubmit from here
        let response: SubmitResponse = self.rpc.call("task_submit", json!([request])).await?;
        debug!("Task {} submitted: {}", response.task_id, request.task_fn);
        Ok(response.task_id)
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus, ComputeError> {
        let response: StatusResponse =
            retry_rpc_operation(|| self.rpc.call("task_getStatus", json!([task_id]))).await?;
        TaskStatus::from_code(response.status)
    }

    async fn task_output(&self, task_id: &str) -> Result<TaskOutput, ComputeError> {
        Ok(retry_rpc_operation(|| self.rpc.call("task_getResult", json!([task_id]))).await?)
    }
}
