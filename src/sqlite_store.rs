//! SQLite-backed [`SessionStore`] implementation.
//!
//! Lays the key-value model out over three tables (see [`crate::migrate`]):
//! `kv_records` for string fields, `kv_sets` for received chunk indices, and
//! `kv_expiry` for per-key deadlines. Expired keys read as absent and are
//! physically removed by [`SessionStore::purge_expired`].
//!
//! Mutating operations issue their write statement first so the connection
//! takes SQLite's write lock up front instead of upgrading a read
//! transaction, which would fail under concurrent writers.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use chunkyard_core::models::{received_key, FIELD_RECEIVED_CHUNKS};
use chunkyard_core::store::{ChunkRecord, Fields, SessionStore};

/// SQLite implementation of the [`SessionStore`] trait.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Close the underlying pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

const LIVE: &str = "EXISTS (SELECT 1 FROM kv_expiry WHERE key = ? AND expires_at > ?)";

async fn is_live<'e, E>(executor: E, key: &str) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let live: bool = sqlx::query_scalar(&format!("SELECT {}", LIVE))
        .bind(key)
        .bind(now_ms())
        .fetch_one(executor)
        .await?;
    Ok(live)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn put_record(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = now_ms() + ttl.as_millis() as i64;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO kv_expiry (key, expires_at) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM kv_records WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM kv_sets WHERE key = ?")
            .bind(received_key(key))
            .execute(&mut *tx)
            .await?;

        for (field, value) in fields {
            sqlx::query("INSERT INTO kv_records (key, field, value) VALUES (?, ?, ?)")
                .bind(key)
                .bind(field)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_record(&self, key: &str) -> Result<Option<Fields>> {
        let rows = sqlx::query(
            r#"
            SELECT r.field, r.value
            FROM kv_records r
            JOIN kv_expiry e ON e.key = r.key
            WHERE r.key = ? AND e.expires_at > ?
            "#,
        )
        .bind(key)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            rows.iter()
                .map(|row| (row.get("field"), row.get("value")))
                .collect(),
        ))
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO kv_records (key, field, value)
            SELECT ?, ?, ? WHERE {}
            ON CONFLICT(key, field) DO UPDATE SET value = excluded.value
            "#,
            LIVE
        ))
        .bind(key)
        .bind(field)
        .bind(value)
        .bind(key)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn incr_field(&self, key: &str, field: &str, delta: i64) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(&format!(
            "UPDATE kv_records SET value = CAST(CAST(value AS INTEGER) + ? AS TEXT) \
             WHERE key = ? AND field = ? AND {}",
            LIVE
        ))
        .bind(delta)
        .bind(key)
        .bind(field)
        .bind(key)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            if !is_live(&mut *tx, key).await? {
                tx.rollback().await?;
                return Ok(None);
            }
            sqlx::query("INSERT INTO kv_records (key, field, value) VALUES (?, ?, ?)")
                .bind(key)
                .bind(field)
                .bind(delta.to_string())
                .execute(&mut *tx)
                .await?;
        }

        let value: String =
            sqlx::query_scalar("SELECT value FROM kv_records WHERE key = ? AND field = ?")
                .bind(key)
                .bind(field)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(Some(value.parse()?))
    }

    async fn record_chunk(&self, key: &str, index: u32) -> Result<ChunkRecord> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO kv_sets (key, member) SELECT ?, ? WHERE {} \
             ON CONFLICT(key, member) DO NOTHING",
            LIVE
        ))
        .bind(received_key(key))
        .bind(index as i64)
        .bind(key)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;

        let added = inserted.rows_affected() == 1;
        if added {
            sqlx::query(
                "UPDATE kv_records SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT) \
                 WHERE key = ? AND field = ?",
            )
            .bind(key)
            .bind(FIELD_RECEIVED_CHUNKS)
            .execute(&mut *tx)
            .await?;
        } else if !is_live(&mut *tx, key).await? {
            tx.rollback().await?;
            return Ok(ChunkRecord::Missing);
        }

        let received: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_records WHERE key = ? AND field = ?")
                .bind(key)
                .bind(FIELD_RECEIVED_CHUNKS)
                .fetch_optional(&mut *tx)
                .await?;

        tx.commit().await?;

        let received = received
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or_default();
        Ok(if added {
            ChunkRecord::Added { received }
        } else {
            ChunkRecord::Duplicate { received }
        })
    }

    async fn received(&self, key: &str) -> Result<Vec<u32>> {
        let rows: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT member FROM kv_sets WHERE key = ? AND {} ORDER BY member ASC",
            LIVE
        ))
        .bind(received_key(key))
        .bind(key)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|m| m as u32).collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM kv_records WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM kv_sets WHERE key = ?")
            .bind(received_key(key))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM kv_expiry WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM kv_records WHERE key IN (SELECT key FROM kv_expiry WHERE expires_at <= ?)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Set keys are the record key plus the received-set suffix.
        sqlx::query(
            "DELETE FROM kv_sets WHERE key IN \
             (SELECT key || ? FROM kv_expiry WHERE expires_at <= ?)",
        )
        .bind(received_key(""))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let purged = sqlx::query("DELETE FROM kv_expiry WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(purged.rows_affected())
    }
}
