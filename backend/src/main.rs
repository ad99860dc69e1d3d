//! # Salad Operator Service
//!
//! This is the main entry point of the operator that coordinates Salad
//! mixing deals. It provides:
//!
//! - REST API and WebSocket actions for depositors (submit, quorum, config)
//! - Real-time notifications of the settlement countdown and deals
//! - A settlement loop that creates deals on the public ledger and
//!   executes them on the confidential computation network
//! - Durable storage of deposits, deals and operator cache
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        OPERATOR SERVICE                          │
//! │                                                                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  REST API   │  │  WebSocket  │  │    Settlement Loop      │  │
//! │  │  (Actix)    │  │  Server     │  │  • Block countdown      │  │
//! │  │             │  │             │  │  • Deal creation        │  │
//! │  │  /operator  │  │  /ws/:id    │  │  • Deal execution       │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │         │                │                     │                 │
//! │         └────────────────┴─────────────────────┘                 │
//! │                          │                                       │
//! │  ┌───────────────────────┴───────────────────────────────────┐  │
//! │  │                    SERVICE LAYER                           │  │
//! │  │  ┌──────────────────┐ ┌────────────┐ ┌─────────────────┐  │  │
//! │  │  │OperatorCoordinator│ │DealManager │ │SecretCompute    │  │  │
//! │  │  └──────────────────┘ └────────────┘ └─────────────────┘  │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                          │                                       │
//! │         ┌────────────────┼────────────────┐                     │
//! │         │                │                │                      │
//! │  ┌──────┴──────┐  ┌──────┴──────┐  ┌──────┴──────┐              │
//! │  │  PostgreSQL │  │  Ethereum   │  │   Enigma    │              │
//! │  │  Store      │  │  RPC        │  │   RPC       │              │
//! │  └─────────────┘  └─────────────┘  └─────────────┘              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Set up PostgreSQL and create the database (or leave `DATABASE_URL`
//!    unset for an in-memory store)
//! 2. Copy `.env.example` to `.env` and configure
//! 3. Start the operator: `cargo run`
//! 4. Pass `--truncate` (`-t`) to wipe deposits, deals and cache on start
//!
//! ## Environment Variables
//!
//! See `.env.example` for all configuration.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod compute;
mod config;
mod db;
mod ledger;
mod models;
mod services;
mod utils;
mod websocket;

#[cfg(test)]
mod testing;

use compute::RpcComputeTransport;
use config::AppConfig;
use db::{Database, LedgerStore, MemoryStore, PgStore};
use ledger::{EthRpcLedger, LedgerContract};
use services::{DealManager, OperatorCoordinator, RetryPolicy, SecretComputeClient};
use websocket::WsRegistry;

/// Application state shared across all handlers.
pub struct AppState {
    /// Deposit/deal ledger store
    pub store: Arc<dyn LedgerStore>,

    /// Salad contract on the public ledger
    pub ledger: Arc<dyn LedgerContract>,

    /// Operator coordinator
    pub coordinator: Arc<OperatorCoordinator>,

    /// WebSocket connection registry for real-time updates
    pub ws_registry: WsRegistry,
}

fn startup_error(context: &str, err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(format!("{}: {}", context, err))
}

/// Main entry point of the operator.
///
/// This function:
/// 1. Loads configuration from environment
/// 2. Opens the ledger store
/// 3. Resolves contract addresses
/// 4. Builds the ledger and confidential network clients
/// 5. Starts the settlement loop
/// 6. Launches the HTTP server
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // =========================================
    // STEP 1: Initialize Logging
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| startup_error("Failed to set tracing subscriber", e))?;

    info!("🥗 Starting Salad Operator");

    // =========================================
    // STEP 2: Load Configuration
    // =========================================
    let config = AppConfig::from_env().map_err(|e| startup_error("Failed to load configuration", e))?;

    info!("📋 Configuration loaded");
    info!("   Ethereum RPC: {}", config.eth_rpc_url);
    info!("   Enigma RPC: {}", config.enigma_url);
    info!("   Operator: {}", config.operator_address);
    info!(
        "   Threshold: {} deposits, every {} blocks",
        config.threshold, config.deal_interval_blocks
    );

    // =========================================
    // STEP 3: Open the Ledger Store
    // =========================================
    let store: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => {
            let db = Database::connect(url)
                .await
                .map_err(|e| startup_error("Failed to connect to database", e))?;
            db.run_migrations()
                .await
                .map_err(|e| startup_error("Failed to run migrations", e))?;
            info!("🗄️  PostgreSQL store ready");
            Arc::new(PgStore::new(db))
        }
        None => {
            warn!("DATABASE_URL not set, keeping the ledger in memory");
            Arc::new(MemoryStore::new())
        }
    };

    if std::env::args().any(|arg| arg == "-t" || arg == "--truncate") {
        warn!("Truncating deposits, deals and cache");
        store
            .truncate()
            .await
            .map_err(|e| startup_error("Failed to truncate store", e))?;
    }

    // =========================================
    // STEP 4: Resolve Contract Addresses
    // =========================================
    let cached = store
        .get_deployment()
        .await
        .map_err(|e| startup_error("Failed to read deployment", e))?;
    let deployment = config
        .deployment
        .resolve(cached.as_ref())
        .map_err(|e| startup_error("Contract addresses unknown", e))?;
    match &cached {
        None => store
            .set_deployment(&deployment)
            .await
            .map_err(|e| startup_error("Failed to store deployment", e))?,
        Some(cached) if *cached != deployment => {
            warn!("Configured contract addresses differ from the stored deployment")
        }
        Some(_) => {}
    }

    info!("📜 Salad contract: {}", deployment.salad_contract);
    info!("   Secret contract: {}", deployment.secret_contract);

    // =========================================
    // STEP 5: Initialize Clients and Services
    // =========================================
    let ledger: Arc<dyn LedgerContract> = Arc::new(
        EthRpcLedger::new(&config.eth_rpc_url, &deployment.salad_contract, config.receipt_timeout)
            .map_err(|e| startup_error("Failed to create ledger client", e))?,
    );
    let transport = Arc::new(
        RpcComputeTransport::new(&config.enigma_url)
            .map_err(|e| startup_error("Failed to create Enigma client", e))?,
    );

    let compute = Arc::new(SecretComputeClient::new(
        transport,
        store.clone(),
        &config.operator_address,
        &deployment.secret_contract,
        config.task_poll_interval,
        config.gas.clone(),
    ));
    let deal_manager = Arc::new(DealManager::new(
        store.clone(),
        ledger.clone(),
        compute.clone(),
        &config.operator_address,
        config.deal_interval_blocks,
        config.gas.create_deal_gas,
    ));
    let coordinator = Arc::new(OperatorCoordinator::new(
        deal_manager,
        store.clone(),
        ledger.clone(),
        compute,
        deployment,
        config.threshold,
        config.poll_interval,
        RetryPolicy::unbounded(config.pause_on_retry),
    ));

    info!("🔧 Services initialized");

    let ws_registry = WsRegistry::new();

    let app_state = Arc::new(AppState {
        store: store.clone(),
        ledger,
        coordinator: coordinator.clone(),
        ws_registry: ws_registry.clone(),
    });

    // =========================================
    // STEP 6: Start Background Services
    // =========================================
    tokio::spawn(websocket::forward_events(coordinator.subscribe(), ws_registry));

    let loop_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = loop_coordinator.activate().await {
            tracing::error!("Operator activation failed: {}", e);
            return;
        }
        match loop_coordinator.recover_pending_deals().await {
            Ok(0) => {}
            Ok(count) => info!("Recovered {} unfinished deals", count),
            Err(e) => tracing::error!("Deal recovery failed: {}", e),
        }
        loop_coordinator.run().await;
    });

    info!("⏱️  Settlement loop started");

    // =========================================
    // STEP 7: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    HttpServer::new(move || {
        App::new()
            // Attach shared application state
            .app_data(web::Data::new(app_state.clone()))

            // Browsers connect from the mixer frontend
            .wrap(Cors::permissive())

            // Add logging middleware
            .wrap(middleware::Logger::default())

            // Configure API routes
            .configure(api::configure_routes)

            // Configure WebSocket routes
            .configure(websocket::configure_routes)
    })
    .bind(format!("{}:{}", server_host, server_port))?
    .run()
    .await?;

    coordinator.shutdown().await;
    info!("Operator stopped");
    Ok(())
}
