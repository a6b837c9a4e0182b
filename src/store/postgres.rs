use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::error;

use super::SwapStore;
use crate::error::StoreError;
use crate::types::{HashLock, OrderId, SwapRecord};

/// PostgreSQL-backed store. Records are kept as JSONB.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .wrap_err("Failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .wrap_err("Failed to run database migrations")?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!(error = ?e, "SQL error: {}", context);
        StoreError::Database(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl SwapStore for PgStore {
    async fn get(&self, order_id: &OrderId) -> Result<Option<SwapRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT record FROM swaps WHERE order_id = $1
            UNION ALL
            SELECT record FROM swap_history WHERE order_id = $1
            LIMIT 1
            "#,
        )
        .bind(order_id.to_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get swap"))?;

        match row {
            Some(row) => {
                let Json(record): Json<SwapRecord> =
                    row.try_get("record").map_err(|e| StoreError::Corrupt {
                        order_id: order_id.to_hex(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: &SwapRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swaps (order_id, status, record)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id)
            DO UPDATE SET status = EXCLUDED.status, record = EXCLUDED.record, updated_at = NOW()
            "#,
        )
        .bind(record.order.id.to_hex())
        .bind(record.state.status.as_str())
        .bind(Json(record))
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to upsert swap"))?;
        Ok(())
    }

    async fn delete(&self, order_id: &OrderId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM swaps WHERE order_id = $1")
            .bind(order_id.to_hex())
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to delete swap"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn archive(&self, order_id: &OrderId) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to begin archive transaction"))?;

        let moved = sqlx::query(
            r#"
            INSERT INTO swap_history (order_id, status, record, created_at)
            SELECT order_id, status, record, created_at FROM swaps WHERE order_id = $1
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.to_hex())
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to copy swap to history"))?;

        sqlx::query("DELETE FROM swaps WHERE order_id = $1")
            .bind(order_id.to_hex())
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to remove archived swap"))?;

        tx.commit()
            .await
            .map_err(db_err("Failed to commit archive transaction"))?;

        Ok(moved.rows_affected() > 0)
    }

    async fn reserve_secret(&self, secret_hash: &HashLock) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO used_secrets (secret_hash) VALUES ($1) ON CONFLICT (secret_hash) DO NOTHING",
        )
        .bind(secret_hash.to_hex())
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to reserve secret"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_active(&self) -> Result<Vec<OrderId>, StoreError> {
        let rows = sqlx::query("SELECT order_id FROM swaps ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list active swaps"))?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("order_id");
                OrderId::from_hex(&raw).map_err(|reason| StoreError::Corrupt {
                    order_id: raw.clone(),
                    reason,
                })
            })
            .collect()
    }
}
