//! # Database Queries
//!
//! This module contains all the SQL queries for interacting with the database.
//! Each function performs a specific database operation.
//!
//! ## Query Organization
//!
//! Queries are grouped by the table they operate on:
//! - `deposit_*` / `*_deposits` - Deposit table operations
//! - `deal_*` / `*_deals` - Deal table operations
//! - `cache_*` - Singleton configuration values
//!
//! ## Amounts
//!
//! Amounts are `u128` in Rust and `NUMERIC(78,0)` in PostgreSQL. They are
//! bound as text (`$n::TEXT::NUMERIC`) and read back with `::TEXT`.
//!
//! ## Error Handling
//!
//! All queries return `Result<T, DatabaseError>`. Common errors:
//! - `NotFound` - Record doesn't exist
//! - `UniqueViolation` - A unique index rejected the write
//! - `QueryError` - SQL execution failed

use deadpool_postgres::Pool;
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, info, warn};

use super::models::*;
use super::DatabaseError;

// ============================================
// HELPER FUNCTIONS
// ============================================

fn parse_amount(column: &str, text: &str) -> Result<u128, DatabaseError> {
    text.parse()
        .map_err(|e| DatabaseError::InvalidData(format!("{} = {}: {}", column, text, e)))
}

/// Helper to convert a database row to Deposit
fn row_to_deposit(row: &Row) -> Result<Deposit, DatabaseError> {
    let amount: String = row.get("amount");
    Ok(Deposit {
        id: row.get("id"),
        sender: row.get("sender"),
        amount: parse_amount("amount", &amount)?,
        pub_key: row.get("pub_key"),
        enc_recipient: row.get("enc_recipient"),
        signature: row.get("signature"),
        deal_id: row.get("deal_id"),
        created_at: row.get("created_at"),
    })
}

/// Helper to convert a database row to Deal
fn row_to_deal(row: &Row) -> Result<Deal, DatabaseError> {
    let amount: String = row.get("deposit_amount");
    let status: String = row.get("status");
    let nonce: i64 = row.get("nonce");
    Ok(Deal {
        deal_id: row.get("deal_id"),
        deposit_amount: parse_amount("deposit_amount", &amount)?,
        participants: row.get("participants"),
        nonce: nonce as u64,
        status: status.parse().map_err(DatabaseError::InvalidData)?,
        tx_hash: row.get("tx_hash"),
        task_id: row.get("task_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const DEPOSIT_COLUMNS: &str = r#"
    id, sender, amount::TEXT AS amount, pub_key, enc_recipient,
    signature, deal_id, created_at
"#;

const DEAL_COLUMNS: &str = r#"
    deal_id, deposit_amount::TEXT AS deposit_amount, participants, nonce,
    status, tx_hash, task_id, created_at, updated_at
"#;

// ============================================
// DEPOSIT QUERIES
// ============================================

/// Insert a new fillable deposit.
///
/// Returns `UniqueViolation` if the sender already has an unassigned
/// deposit (partial unique index `deposits_one_fillable_per_sender`).
pub async fn insert_deposit(pool: &Pool, deposit: &NewDeposit) -> Result<Deposit, DatabaseError> {
    debug!("Inserting deposit for sender: {}", deposit.sender);

    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let amount = deposit.amount.to_string();
    let result = client.query_one(
        &format!(
            r#"
            INSERT INTO deposits (sender, amount, pub_key, enc_recipient, signature)
            VALUES ($1, $2::TEXT::NUMERIC, $3, $4, $5)
            RETURNING {}
            "#,
            DEPOSIT_COLUMNS
        ),
        &[
            &deposit.sender,
            &amount,
            &deposit.pub_key,
            &deposit.enc_recipient,
            &deposit.signature,
        ],
    ).await;

    match result {
        Ok(row) => row_to_deposit(&row),
        Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
            Err(DatabaseError::UniqueViolation(deposit.sender.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Mark the sender's unassigned deposit as discarded.
///
/// Returns the number of rows touched (0 or 1).
pub async fn discard_deposit(pool: &Pool, sender: &str) -> Result<u64, DatabaseError> {
    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let rows_affected = client.execute(
        r#"
        UPDATE deposits
        SET deal_id = $2
        WHERE sender = $1 AND deal_id IS NULL
        "#,
        &[&sender, &DISCARDED_DEAL_ID],
    ).await?;

    if rows_affected > 0 {
        info!("Deposit discarded for sender: {}", sender);
    }
    Ok(rows_affected)
}

/// Get all fillable deposits of at least `min_amount`, in insertion order.
pub async fn get_fillable_deposits(
    pool: &Pool,
    min_amount: u128,
) -> Result<Vec<Deposit>, DatabaseError> {
    debug!("Fetching fillable deposits (min amount: {})", min_amount);

    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let min_amount = min_amount.to_string();
    let rows = client.query(
        &format!(
            r#"
            SELECT {}
            FROM deposits
            WHERE deal_id IS NULL AND amount >= $1::TEXT::NUMERIC
            ORDER BY id ASC
            "#,
            DEPOSIT_COLUMNS
        ),
        &[&min_amount],
    ).await?;

    rows.iter().map(row_to_deposit).collect()
}

/// Assign the unassigned deposits of `senders` to `deal_id`.
///
/// Runs in a transaction. The update is committed only if exactly one
/// row per sender was touched; otherwise it is rolled back. Returns the
/// number of rows the update matched either way.
pub async fn assign_deposits(
    pool: &Pool,
    deal_id: &str,
    senders: &[String],
) -> Result<u64, DatabaseError> {
    debug!("Assigning {} deposits to deal {}", senders.len(), deal_id);

    let mut client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let transaction = client.transaction().await?;

    let rows_affected = transaction.execute(
        r#"
        UPDATE deposits
        SET deal_id = $1
        WHERE deal_id IS NULL AND sender = ANY($2)
        "#,
        &[&deal_id, &senders],
    ).await?;

    if rows_affected == senders.len() as u64 {
        transaction.commit().await?;
        info!("Assigned {} deposits to deal {}", rows_affected, deal_id);
    } else {
        transaction.rollback().await?;
        warn!(
            "Assignment to deal {} rolled back: {} rows matched, {} expected",
            deal_id,
            rows_affected,
            senders.len()
        );
    }

    Ok(rows_affected)
}

/// Get the deposits assigned to a deal, in insertion order.
pub async fn get_deal_deposits(pool: &Pool, deal_id: &str) -> Result<Vec<Deposit>, DatabaseError> {
    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let rows = client.query(
        &format!(
            r#"
            SELECT {}
            FROM deposits
            WHERE deal_id = $1
            ORDER BY id ASC
            "#,
            DEPOSIT_COLUMNS
        ),
        &[&deal_id],
    ).await?;

    rows.iter().map(row_to_deposit).collect()
}

// ============================================
// DEAL QUERIES
// ============================================

/// Record a new deal.
pub async fn insert_deal(pool: &Pool, deal: &Deal) -> Result<(), DatabaseError> {
    debug!("Inserting deal: {}", deal.deal_id);

    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let amount = deal.deposit_amount.to_string();
    let nonce = deal.nonce as i64;
    let status = deal.status.as_str();
    let result = client.execute(
        r#"
        INSERT INTO deals (
            deal_id, deposit_amount, participants, nonce,
            status, tx_hash, task_id, created_at, updated_at
        )
        VALUES ($1, $2::TEXT::NUMERIC, $3, $4, $5, $6, $7, $8, $9)
        "#,
        &[
            &deal.deal_id,
            &amount,
            &deal.participants,
            &nonce,
            &status,
            &deal.tx_hash,
            &deal.task_id,
            &deal.created_at,
            &deal.updated_at,
        ],
    ).await;

    match result {
        Ok(_) => {
            info!("Deal created: {}", deal.deal_id);
            Ok(())
        }
        Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
            Err(DatabaseError::UniqueViolation(deal.deal_id.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Update the mutable fields of a deal.
pub async fn update_deal(pool: &Pool, deal: &Deal) -> Result<(), DatabaseError> {
    debug!("Updating deal {} status to: {}", deal.deal_id, deal.status);

    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let status = deal.status.as_str();
    let rows_affected = client.execute(
        r#"
        UPDATE deals
        SET
            status = $2,
            tx_hash = $3,
            task_id = $4,
            updated_at = NOW()
        WHERE deal_id = $1
        "#,
        &[&deal.deal_id, &status, &deal.tx_hash, &deal.task_id],
    ).await?;

    if rows_affected == 0 {
        return Err(DatabaseError::NotFound(format!("Deal not found: {}", deal.deal_id)));
    }

    Ok(())
}

/// Get a deal by id.
pub async fn get_deal(pool: &Pool, deal_id: &str) -> Result<Option<Deal>, DatabaseError> {
    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let row = client.query_opt(
        &format!("SELECT {} FROM deals WHERE deal_id = $1", DEAL_COLUMNS),
        &[&deal_id],
    ).await?;

    row.as_ref().map(row_to_deal).transpose()
}

/// Get deals, optionally filtered by status, oldest first.
pub async fn get_deals(
    pool: &Pool,
    status: Option<DealStatus>,
) -> Result<Vec<Deal>, DatabaseError> {
    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let status = status.map(|s| s.as_str());
    let rows = client.query(
        &format!(
            r#"
            SELECT {}
            FROM deals
            WHERE $1::TEXT IS NULL OR status = $1
            ORDER BY created_at ASC
            "#,
            DEAL_COLUMNS
        ),
        &[&status],
    ).await?;

    rows.iter().map(row_to_deal).collect()
}

// ============================================
// CACHE QUERIES
// ============================================

/// Read a cached configuration value.
pub async fn get_cache_value(
    pool: &Pool,
    key: &str,
) -> Result<Option<serde_json::Value>, DatabaseError> {
    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    let row = client.query_opt(
        "SELECT value FROM cache WHERE key = $1",
        &[&key],
    ).await?;

    Ok(row.map(|r| r.get("value")))
}

/// Create or replace a cached configuration value.
pub async fn set_cache_value(
    pool: &Pool,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), DatabaseError> {
    debug!("Setting cache value: {}", key);

    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    client.execute(
        r#"
        INSERT INTO cache (key, value, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (key) DO UPDATE SET
            value = EXCLUDED.value,
            updated_at = EXCLUDED.updated_at
        "#,
        &[&key, value],
    ).await?;

    Ok(())
}

// ============================================
// MAINTENANCE
// ============================================

/// Remove every row of every table.
pub async fn truncate_all(pool: &Pool) -> Result<(), DatabaseError> {
    let client = pool.get().await
        .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

    client.batch_execute("TRUNCATE TABLE deposits, deals, cache RESTART IDENTITY").await?;

    warn!("Truncated deposits, deals and cache tables");
    Ok(())
}
