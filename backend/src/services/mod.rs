//! # Services Module
//!
//! This module contains the business logic of the Salad operator. Each
//! service handles a specific domain.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `OperatorCoordinator` | Settlement loop, deposit submission, events |
//! | `DealManager` | Deposit registration, deal creation and execution |
//! | `SecretComputeClient` | Remote tasks on the confidential network |
//! | `signature` | Typed-data signature verification of deposits |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                 OperatorCoordinator                       │   │
//! │  │  • activate()   • run_cycle()   • submit_deposit_metadata()│  │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │              │                           │                       │
//! │              ▼                           ▼                       │
//! │  ┌──────────────────────┐       ┌──────────────────┐            │
//! │  │     DealManager      │       │    signature     │            │
//! │  │ register, reserve,   │       │ EIP-712 recovery │            │
//! │  │ publish, execute     │       └──────────────────┘            │
//! │  └──────────────────────┘                                       │
//! │              │                                                   │
//! │              ▼                                                   │
//! │  ┌──────────────────────┐                                       │
//! │  │ SecretComputeClient  │                                       │
//! │  │ tasks, key rotation  │                                       │
//! │  └──────────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod coordinator;
pub mod deal_manager;
pub mod events;
pub mod retry;
pub mod secret_compute;
pub mod signature;

pub use coordinator::{CycleOutcome, OperatorConfig, OperatorCoordinator, OperatorError};
pub use deal_manager::{DealError, DealManager};
pub use events::OperatorEvent;
pub use retry::RetryPolicy;
pub use secret_compute::SecretComputeClient;
