//! Settings database operations
//!
//! Key/value runtime overrides. Values win over the TOML bootstrap value
//! when present.

use oais_common::{Error, Result};
use sqlx::SqlitePool;

/// Lock wait used by retry_on_lock for request transactions
pub const MAX_LOCK_WAIT_KEY: &str = "ingest_database_max_lock_wait_ms";

/// Max lock wait override, or `default` when unset
pub async fn get_max_lock_wait_ms(db: &SqlitePool, default: u64) -> Result<u64> {
    get_setting(db, MAX_LOCK_WAIT_KEY)
        .await
        .map(|opt| opt.unwrap_or(default))
}

pub async fn set_max_lock_wait_ms(db: &SqlitePool, value: u64) -> Result<()> {
    set_setting(db, MAX_LOCK_WAIT_KEY, value).await
}

async fn get_setting<T>(db: &SqlitePool, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match row {
        Some((value,)) => {
            let parsed = value
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Parse setting {} failed: {}", key, e)))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

async fn set_setting<T>(db: &SqlitePool, key: &str, value: T) -> Result<()>
where
    T: std::fmt::Display,
{
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}
