use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the key-value tables if they are missing. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per (record, field); values are always text
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_records (
            key TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (key, field)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Set members (received chunk indices), keyed "{id}:chunks_received"
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_sets (
            key TEXT NOT NULL,
            member INTEGER NOT NULL,
            PRIMARY KEY (key, member)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Expiry per record key (unix milliseconds)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_expiry (
            key TEXT PRIMARY KEY,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_expiry_expires_at ON kv_expiry(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}
