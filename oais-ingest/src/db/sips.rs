//! SIP entity persistence

use oais_common::time::{from_db, to_db};
use oais_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

use crate::models::{SipEntity, SipState};

const SIP_COLUMNS: &str = "id, sip_id, provider_id, version, checksum, session_owner, session, \
                           state, sip, errors, creation_date, last_update";

fn sip_from_row(row: &SqliteRow) -> Result<SipEntity> {
    let state: String = row.try_get("state")?;
    let sip: String = row.try_get("sip")?;
    let errors: String = row.try_get("errors")?;
    let creation_date: String = row.try_get("creation_date")?;
    let last_update: String = row.try_get("last_update")?;

    Ok(SipEntity {
        id: row.try_get("id")?,
        sip_id: row.try_get("sip_id")?,
        provider_id: row.try_get("provider_id")?,
        version: row.try_get("version")?,
        checksum: row.try_get("checksum")?,
        session_owner: row.try_get("session_owner")?,
        session: row.try_get("session")?,
        state: SipState::parse(&state)?,
        sip: serde_json::from_str(&sip)?,
        errors: serde_json::from_str(&errors)?,
        creation_date: from_db(&creation_date)?,
        last_update: from_db(&last_update)?,
    })
}

/// Insert a new SIP, returning its surrogate id
pub async fn insert_sip<'e, E>(executor: E, sip: &SipEntity) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(&sip.sip)?;
    let errors = serde_json::to_string(&sip.errors)?;

    let result = sqlx::query(
        r#"
        INSERT INTO sips (
            sip_id, provider_id, version, checksum, session_owner, session,
            state, sip, errors, creation_date, last_update
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&sip.sip_id)
    .bind(&sip.provider_id)
    .bind(sip.version)
    .bind(&sip.checksum)
    .bind(&sip.session_owner)
    .bind(&sip.session)
    .bind(sip.state.as_str())
    .bind(&payload)
    .bind(&errors)
    .bind(to_db(&sip.creation_date))
    .bind(to_db(&sip.last_update))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Persist state, payload and errors of an existing SIP
pub async fn update_sip<'e, E>(executor: E, sip: &SipEntity) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(&sip.sip)?;
    let errors = serde_json::to_string(&sip.errors)?;

    sqlx::query(
        "UPDATE sips SET state = ?, sip = ?, checksum = ?, errors = ?, last_update = ? WHERE id = ?",
    )
    .bind(sip.state.as_str())
    .bind(&payload)
    .bind(&sip.checksum)
    .bind(&errors)
    .bind(to_db(&oais_common::time::now()))
    .bind(sip.id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Set state, replacing the error list when `errors` is given.
///
/// DELETED is final: a deleted (or removed) SIP is left as it is.
pub async fn set_sip_state<'e, E>(
    executor: E,
    id: i64,
    state: SipState,
    errors: Option<&[String]>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let errors = errors.map(serde_json::to_string).transpose()?;

    sqlx::query(
        "UPDATE sips SET state = ?, errors = COALESCE(?, errors), last_update = ? \
         WHERE id = ? AND state <> 'DELETED'",
    )
    .bind(state.as_str())
    .bind(errors)
    .bind(to_db(&oais_common::time::now()))
    .bind(id)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn find_sip<'e, E>(executor: E, id: i64) -> Result<Option<SipEntity>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {} FROM sips WHERE id = ?", SIP_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(sip_from_row).transpose()
}

/// SIPs of a session, oldest first
pub async fn find_by_session<'e, E>(
    executor: E,
    session_owner: &str,
    session: &str,
) -> Result<Vec<SipEntity>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {} FROM sips WHERE session_owner = ? AND session = ? ORDER BY id",
        SIP_COLUMNS
    ))
    .bind(session_owner)
    .bind(session)
    .fetch_all(executor)
    .await?;

    rows.iter().map(sip_from_row).collect()
}

/// Next version number for a provider id (1 for a new provider)
pub async fn next_version<'e, E>(executor: E, provider_id: &str) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM sips WHERE provider_id = ?")
        .bind(provider_id)
        .fetch_one(executor)
        .await?;

    Ok(max.unwrap_or(0) + 1)
}

/// True when a live (not ERROR/DELETED) SIP already has this checksum
pub async fn is_checksum_ingested<'e, E>(executor: E, checksum: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sips WHERE checksum = ? AND state NOT IN ('ERROR', 'DELETED')",
    )
    .bind(checksum)
    .fetch_one(executor)
    .await?;

    Ok(count > 0)
}

pub async fn delete_sip<'e, E>(executor: E, id: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM sips WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}
