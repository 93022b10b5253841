//! PostgreSQL off-chain store implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, BatchStatus, CustodyRecord, CustodySource, CustodyStatus, DatabaseClient,
    DatabaseError, NewCustodyRecord, NewUnitBatch, TokenId, UnitBatch,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

const BATCH_COLUMNS: &str = "id, producer_address, product_ref, quantity, production_date, \
     expiry_date, metadata_ref, token_ids, mint_tx_ref, status, created_at, updated_at";

const RECORD_COLUMNS: &str = "id, source_kind, source_id, source_address, destination_address, \
     destination_role, quantity, token_ids, tx_ref, pending_tx_ref, status, attempt_count, \
     last_error, created_at, updated_at";

/// PostgreSQL database client with connection pooling
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_batch(row: &sqlx::postgres::PgRow) -> Result<UnitBatch, AppError> {
        let status: String = row.get("status");
        let quantity: i32 = row.get("quantity");

        Ok(UnitBatch {
            id: row.get("id"),
            producer_address: row.get("producer_address"),
            product_ref: row.get("product_ref"),
            quantity: from_db_quantity(quantity)?,
            production_date: row.get("production_date"),
            expiry_date: row.get("expiry_date"),
            metadata_ref: row.get("metadata_ref"),
            token_ids: from_db_ids(row.get("token_ids"))?,
            mint_tx_ref: row.get("mint_tx_ref"),
            status: status.parse().map_err(corrupt_row)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<CustodyRecord, AppError> {
        let source_kind: String = row.get("source_kind");
        let destination_role: String = row.get("destination_role");
        let status: String = row.get("status");
        let quantity: i32 = row.get("quantity");

        Ok(CustodyRecord {
            id: row.get("id"),
            source: CustodySource::from_parts(&source_kind, row.get("source_id"))
                .map_err(corrupt_row)?,
            source_address: row.get("source_address"),
            destination_address: row.get("destination_address"),
            destination_role: destination_role.parse().map_err(corrupt_row)?,
            quantity: from_db_quantity(quantity)?,
            token_ids: from_db_ids(row.get("token_ids"))?,
            tx_ref: row.get("tx_ref"),
            pending_tx_ref: row.get("pending_tx_ref"),
            status: status.parse().map_err(corrupt_row)?,
            attempt_count: row.get("attempt_count"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

fn corrupt_row(message: String) -> AppError {
    AppError::Database(DatabaseError::Query(message))
}

fn from_db_quantity(quantity: i32) -> Result<u32, AppError> {
    u32::try_from(quantity).map_err(|_| corrupt_row(format!("Negative quantity {}", quantity)))
}

fn from_db_ids(ids: Vec<i64>) -> Result<Vec<TokenId>, AppError> {
    ids.into_iter()
        .map(|id| TokenId::try_from(id).map_err(|_| corrupt_row(format!("Negative token id {}", id))))
        .collect()
}

fn to_db_ids(ids: &[TokenId]) -> Result<Vec<i64>, AppError> {
    ids.iter()
        .map(|id| {
            i64::try_from(*id).map_err(|_| {
                AppError::invalid_field("token_ids", format!("Token id {} exceeds store range", id))
            })
        })
        .collect()
}

fn to_db_quantity(quantity: u32) -> Result<i32, AppError> {
    i32::try_from(quantity)
        .map_err(|_| AppError::invalid_field("quantity", format!("Quantity {} too large", quantity)))
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, batch), fields(tx_ref = %batch.mint_tx_ref, quantity = batch.quantity))]
    async fn create_batch(&self, batch: &NewUnitBatch) -> Result<UnitBatch, AppError> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let status = BatchStatus::Minted;

        sqlx::query(
            r#"
            INSERT INTO unit_batches (
                id, producer_address, product_ref, quantity, production_date,
                expiry_date, metadata_ref, token_ids, mint_tx_ref, status,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&id)
        .bind(&batch.producer_address)
        .bind(&batch.product_ref)
        .bind(to_db_quantity(batch.quantity)?)
        .bind(batch.production_date)
        .bind(batch.expiry_date)
        .bind(&batch.metadata_ref)
        .bind(to_db_ids(&batch.token_ids)?)
        .bind(&batch.mint_tx_ref)
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(UnitBatch {
            id,
            producer_address: batch.producer_address.clone(),
            product_ref: batch.product_ref.clone(),
            quantity: batch.quantity,
            production_date: batch.production_date,
            expiry_date: batch.expiry_date,
            metadata_ref: batch.metadata_ref.clone(),
            token_ids: batch.token_ids.clone(),
            mint_tx_ref: batch.mint_tx_ref.clone(),
            status,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(self))]
    async fn get_batch(&self, id: &str) -> Result<Option<UnitBatch>, AppError> {
        let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM unit_batches WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        row.as_ref().map(Self::row_to_batch).transpose()
    }

    #[instrument(skip(self))]
    async fn get_batch_by_mint_tx(&self, tx_ref: &str) -> Result<Option<UnitBatch>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM unit_batches WHERE mint_tx_ref = $1"
        ))
        .bind(tx_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        row.as_ref().map(Self::row_to_batch).transpose()
    }

    #[instrument(skip(self))]
    async fn update_batch_status(
        &self,
        id: &str,
        from: BatchStatus,
        to: BatchStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE unit_batches
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, record), fields(source = %record.source.pool_key(), quantity = record.quantity))]
    async fn create_custody_record(
        &self,
        record: &NewCustodyRecord,
    ) -> Result<CustodyRecord, AppError> {
        let id = Uuid::now_v7().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO custody_records (
                id, source_kind, source_id, source_address, destination_address,
                destination_role, quantity, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&id)
        .bind(record.source.kind())
        .bind(record.source.id())
        .bind(&record.source_address)
        .bind(&record.destination_address)
        .bind(record.destination_role.as_str())
        .bind(to_db_quantity(record.quantity)?)
        .bind(CustodyStatus::Draft.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(CustodyRecord {
            id,
            source: record.source.clone(),
            source_address: record.source_address.clone(),
            destination_address: record.destination_address.clone(),
            destination_role: record.destination_role,
            quantity: record.quantity,
            token_ids: Vec::new(),
            tx_ref: None,
            pending_tx_ref: None,
            status: CustodyStatus::Draft,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(self))]
    async fn get_custody_record(&self, id: &str) -> Result<Option<CustodyRecord>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM custody_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    #[instrument(skip(self, token_ids), fields(count = token_ids.len()))]
    async fn assign_token_ids_once(
        &self,
        id: &str,
        token_ids: &[TokenId],
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE custody_records
            SET token_ids = $2, updated_at = NOW()
            WHERE id = $1
              AND status = 'draft'
              AND cardinality(token_ids) = 0
              AND cardinality($2::BIGINT[]) = quantity
            "#,
        )
        .bind(id)
        .bind(to_db_ids(token_ids)?)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn set_pending_tx_ref(&self, id: &str, tx_ref: Option<&str>) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE custody_records
            SET pending_tx_ref = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'draft'
            "#,
        )
        .bind(id)
        .bind(tx_ref)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Draft custody record", id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn attach_tx_ref_and_advance(&self, id: &str, tx_ref: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE custody_records
            SET tx_ref = $2,
                pending_tx_ref = NULL,
                status = 'sent',
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'draft'
              AND tx_ref IS NULL
              AND cardinality(token_ids) = quantity
            "#,
        )
        .bind(id)
        .bind(tx_ref)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error))]
    async fn record_attempt_failure(&self, id: &str, error: &str) -> Result<i32, AppError> {
        let row = sqlx::query(
            r#"
            UPDATE custody_records
            SET attempt_count = attempt_count + 1,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING attempt_count
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        row.map(|r| r.get("attempt_count"))
            .ok_or_else(|| AppError::not_found("Custody record", id))
    }

    #[instrument(skip(self))]
    async fn update_record_status(
        &self,
        id: &str,
        from: CustodyStatus,
        to: CustodyStatus,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE custody_records
            SET status = $3, updated_at = NOW()
            WHERE id = $1
              AND status = $2
              AND (tx_ref IS NOT NULL OR $3 IN ('draft', 'cancelled'))
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(source = %source.pool_key()))]
    async fn list_outbound_records(
        &self,
        source: &CustodySource,
    ) -> Result<Vec<CustodyRecord>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM custody_records \
             WHERE source_kind = $1 AND source_id = $2 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(source.kind())
        .bind(source.id())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
