//! PostgreSQL state manager

use crate::config::DatabaseConfig;
use crate::error::{TxError, TxResult};
use crate::tx::{TransactionRecord, TxId, TxStatus};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Durable mirror of the in-memory transaction store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert or replace a record
    async fn save_record(&self, record: &TransactionRecord) -> TxResult<()>;

    /// Remove pruned records
    async fn delete_records(&self, ids: &[TxId]) -> TxResult<()>;

    /// Remove every record whose id is not in `ids`
    async fn retain_records(&self, ids: &[TxId]) -> TxResult<()>;
}

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> TxResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TxResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id BIGINT PRIMARY KEY,
                from_address VARCHAR(42) NOT NULL,
                status VARCHAR(20) NOT NULL,
                nonce BIGINT,
                hash VARCHAR(66),
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_from_nonce
            ON transactions (from_address, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_status
            ON transactions (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> TxResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Every stored record, oldest first
    pub async fn load_records(&self) -> TxResult<Vec<TransactionRecord>> {
        let rows = sqlx::query("SELECT record FROM transactions ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let json: serde_json::Value = row.get("record");
                serde_json::from_value(json).map_err(TxError::from)
            })
            .collect()
    }

    /// Get transaction statistics
    pub async fn get_stats(&self) -> TxResult<TransactionStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM transactions
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let by_status = rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                let count: i64 = row.get("count");
                (status, count as u64)
            })
            .collect();

        Ok(TransactionStats::from_counts(by_status))
    }
}

#[async_trait]
impl RecordSink for StateManager {
    async fn save_record(&self, record: &TransactionRecord) -> TxResult<()> {
        let json = serde_json::to_value(record)?;

        sqlx::query(
            r#"
            INSERT INTO transactions (id, from_address, status, nonce, hash, record)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id)
            DO UPDATE SET status = $3, nonce = $4, hash = $5, record = $6, updated_at = NOW()
            "#,
        )
        .bind(record.id as i64)
        .bind(format!("{:?}", record.tx_params.from))
        .bind(record.status.as_str())
        .bind(record.tx_params.nonce.map(|n| n as i64))
        .bind(record.hash.map(|h| format!("{:?}", h)))
        .bind(json)
        .execute(&self.pool)
        .await?;

        debug!("Saved transaction {} ({})", record.id, record.status);
        Ok(())
    }

    async fn delete_records(&self, ids: &[TxId]) -> TxResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        sqlx::query("DELETE FROM transactions WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;

        debug!("Deleted {} pruned transactions", ids.len());
        Ok(())
    }

    async fn retain_records(&self, ids: &[TxId]) -> TxResult<()> {
        let ids: Vec<i64> = ids.iter().map(|id| *id as i64).collect();
        let result = sqlx::query("DELETE FROM transactions WHERE NOT (id = ANY($1))")
            .bind(&ids)
            .execute(&self.pool)
            .await?;

        debug!("Removed {} stale transactions", result.rows_affected());
        Ok(())
    }
}

/// Transaction statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionStats {
    pub total: u64,
    pub pending: u64,
    pub by_status: BTreeMap<String, u64>,
}

impl TransactionStats {
    pub fn from_counts(by_status: BTreeMap<String, u64>) -> Self {
        let total = by_status.values().sum();
        let pending = by_status
            .iter()
            .filter(|(status, _)| {
                status
                    .parse::<TxStatus>()
                    .map(|s| s.is_pending())
                    .unwrap_or(false)
            })
            .map(|(_, count)| count)
            .sum();

        Self {
            total,
            pending,
            by_status,
        }
    }

    /// Statistics of in-memory records
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TransactionRecord>) -> Self {
        let mut by_status = BTreeMap::new();
        for record in records {
            *by_status.entry(record.status.to_string()).or_insert(0) += 1;
        }
        Self::from_counts(by_status)
    }
}
