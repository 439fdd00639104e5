//! Postgres-backed shared store via direct SQLx.
//!
//! Each primitive is a single statement, so atomicity comes from the row
//! lock taken by `INSERT ... ON CONFLICT`. Expiry is judged by the database
//! clock, never the caller's.

use std::time::Duration;

use bytes::Bytes;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use super::SharedStateStore;
use crate::error::Result;

/// Store handle. Owns the connection pool shared by all components.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(2))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// The underlying pool, shared with the durable job queue.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM kv_entries WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(removed, "swept expired kv entries");
        Ok(removed)
    }
}

fn secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

impl SharedStateStore for PgStore {
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        // An expired row counts as absent and is taken over in place.
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO kv_entries (key, value, counter, expires_at)
             VALUES ($1, $2, NULL, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value, counter = NULL, expires_at = EXCLUDED.expires_at
               WHERE kv_entries.expires_at <= now()
             RETURNING key",
        )
        .bind(key)
        .bind(value.as_ref())
        .bind(secs(ttl))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let row: Option<(Option<Vec<u8>>, Option<i64>)> = sqlx::query_as(
            "SELECT value, counter FROM kv_entries WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(value, counter)| match (value, counter) {
            (Some(v), _) => Some(Bytes::from(v)),
            (None, Some(n)) => Some(Bytes::from(n.to_string())),
            (None, None) => None,
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let deleted = sqlx::query(
            "DELETE FROM kv_entries WHERE key = $1 AND value = $2 AND expires_at > now()",
        )
        .bind(key)
        .bind(expected)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }

    async fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO kv_entries (key, value, counter, expires_at)
             VALUES ($1, NULL, 1, now() + make_interval(secs => $2))
             ON CONFLICT (key) DO UPDATE SET
               counter = CASE WHEN kv_entries.expires_at <= now() THEN 1
                              ELSE COALESCE(kv_entries.counter, 0) + 1 END,
               value = CASE WHEN kv_entries.expires_at <= now() THEN NULL
                            ELSE kv_entries.value END,
               expires_at = CASE WHEN kv_entries.expires_at <= now() THEN EXCLUDED.expires_at
                                 ELSE kv_entries.expires_at END
             RETURNING counter",
        )
        .bind(key)
        .bind(secs(ttl))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        self.sweep_expired().await
    }
}
