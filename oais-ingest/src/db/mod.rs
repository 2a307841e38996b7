//! Database access for oais-ingest
//!
//! One SQLite database per tenant. The request and entity tables are the
//! single source of truth shared by the scheduler, the worker and callbacks.

pub mod aips;
pub mod jobs;
pub mod requests;
pub mod settings;
pub mod sips;

use oais_common::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Open (creating if needed) a tenant database and its tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sips (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sip_id TEXT NOT NULL UNIQUE,
            provider_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            session_owner TEXT NOT NULL,
            session TEXT NOT NULL,
            state TEXT NOT NULL,
            sip TEXT NOT NULL,
            errors TEXT NOT NULL DEFAULT '[]',
            creation_date TEXT NOT NULL,
            last_update TEXT NOT NULL,
            UNIQUE (provider_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aips (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            aip_id TEXT NOT NULL UNIQUE,
            sip_entity_id INTEGER NOT NULL REFERENCES sips(id) ON DELETE CASCADE,
            provider_id TEXT NOT NULL,
            session_owner TEXT NOT NULL,
            session TEXT NOT NULL,
            state TEXT NOT NULL,
            storages TEXT NOT NULL DEFAULT '[]',
            tags TEXT NOT NULL DEFAULT '[]',
            categories TEXT NOT NULL DEFAULT '[]',
            files TEXT NOT NULL DEFAULT '[]',
            manifest_checksum TEXT,
            errors TEXT NOT NULL DEFAULT '[]',
            creation_date TEXT NOT NULL,
            last_update TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL UNIQUE,
            request_type TEXT NOT NULL,
            state TEXT NOT NULL,
            session_owner TEXT NOT NULL,
            session TEXT NOT NULL,
            provider_id TEXT,
            sip_entity_id INTEGER,
            aip_entity_id INTEGER,
            job_id INTEGER,
            payload TEXT NOT NULL,
            errors TEXT NOT NULL DEFAULT '[]',
            remote_step_deadline TEXT,
            creation_date TEXT NOT NULL,
            last_update TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_type_state ON requests (request_type, state, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_session ON requests (session_owner, session, state)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_group_ids (
            request_id INTEGER NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
            group_id TEXT NOT NULL,
            PRIMARY KEY (request_id, group_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_request_group_ids_group ON request_group_ids (group_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_type TEXT NOT NULL,
            chain TEXT,
            request_ids TEXT NOT NULL,
            status TEXT NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            owner TEXT,
            heartbeat TEXT,
            creation_date TEXT NOT NULL,
            last_update TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (settings, sips, aips, requests, jobs)");

    Ok(())
}

/// Bind placeholders for an `IN (...)` list
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
