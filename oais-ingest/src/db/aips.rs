//! AIP entity persistence

use oais_common::time::{from_db, to_db};
use oais_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

use crate::models::{AipEntity, AipState, SearchCriteria};

use super::placeholders;

const AIP_COLUMNS: &str = "id, aip_id, sip_entity_id, provider_id, session_owner, session, state, \
                           storages, tags, categories, files, manifest_checksum, errors, \
                           creation_date, last_update";

fn aip_from_row(row: &SqliteRow) -> Result<AipEntity> {
    let state: String = row.try_get("state")?;
    let storages: String = row.try_get("storages")?;
    let tags: String = row.try_get("tags")?;
    let categories: String = row.try_get("categories")?;
    let files: String = row.try_get("files")?;
    let errors: String = row.try_get("errors")?;
    let creation_date: String = row.try_get("creation_date")?;
    let last_update: String = row.try_get("last_update")?;

    Ok(AipEntity {
        id: row.try_get("id")?,
        aip_id: row.try_get("aip_id")?,
        sip_entity_id: row.try_get("sip_entity_id")?,
        provider_id: row.try_get("provider_id")?,
        session_owner: row.try_get("session_owner")?,
        session: row.try_get("session")?,
        state: AipState::parse(&state)?,
        storages: serde_json::from_str(&storages)?,
        tags: serde_json::from_str(&tags)?,
        categories: serde_json::from_str(&categories)?,
        files: serde_json::from_str(&files)?,
        manifest_checksum: row.try_get("manifest_checksum")?,
        errors: serde_json::from_str(&errors)?,
        creation_date: from_db(&creation_date)?,
        last_update: from_db(&last_update)?,
    })
}

pub async fn insert_aip<'e, E>(executor: E, aip: &AipEntity) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let storages = serde_json::to_string(&aip.storages)?;
    let tags = serde_json::to_string(&aip.tags)?;
    let categories = serde_json::to_string(&aip.categories)?;
    let files = serde_json::to_string(&aip.files)?;
    let errors = serde_json::to_string(&aip.errors)?;

    let result = sqlx::query(
        r#"
        INSERT INTO aips (
            aip_id, sip_entity_id, provider_id, session_owner, session, state,
            storages, tags, categories, files, manifest_checksum, errors,
            creation_date, last_update
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&aip.aip_id)
    .bind(aip.sip_entity_id)
    .bind(&aip.provider_id)
    .bind(&aip.session_owner)
    .bind(&aip.session)
    .bind(aip.state.as_str())
    .bind(&storages)
    .bind(&tags)
    .bind(&categories)
    .bind(&files)
    .bind(&aip.manifest_checksum)
    .bind(&errors)
    .bind(to_db(&aip.creation_date))
    .bind(to_db(&aip.last_update))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Persist the mutable descriptive part of an AIP (update tasks)
pub async fn update_aip<'e, E>(executor: E, aip: &AipEntity) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let storages = serde_json::to_string(&aip.storages)?;
    let tags = serde_json::to_string(&aip.tags)?;
    let categories = serde_json::to_string(&aip.categories)?;
    let errors = serde_json::to_string(&aip.errors)?;

    sqlx::query(
        r#"
        UPDATE aips
        SET state = ?, storages = ?, tags = ?, categories = ?, errors = ?, last_update = ?
        WHERE id = ?
        "#,
    )
    .bind(aip.state.as_str())
    .bind(&storages)
    .bind(&tags)
    .bind(&categories)
    .bind(&errors)
    .bind(to_db(&oais_common::time::now()))
    .bind(aip.id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Set the state of every AIP of a SIP, replacing errors when given.
/// DELETED AIPs are skipped.
pub async fn set_state_for_sip<'e, E>(
    executor: E,
    sip_entity_id: i64,
    state: AipState,
    errors: Option<&[String]>,
) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let errors = errors.map(serde_json::to_string).transpose()?;

    let result = sqlx::query(
        "UPDATE aips SET state = ?, errors = COALESCE(?, errors), last_update = ? \
         WHERE sip_entity_id = ? AND state <> 'DELETED'",
    )
    .bind(state.as_str())
    .bind(errors)
    .bind(to_db(&oais_common::time::now()))
    .bind(sip_entity_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Same as [`set_state_for_sip`] for a single AIP
pub async fn set_aip_state<'e, E>(
    executor: E,
    id: i64,
    state: AipState,
    errors: Option<&[String]>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let errors = errors.map(serde_json::to_string).transpose()?;

    sqlx::query(
        "UPDATE aips SET state = ?, errors = COALESCE(?, errors), last_update = ? \
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

pub async fn set_manifest_checksum<'e, E>(executor: E, id: i64, checksum: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE aips SET manifest_checksum = ?, last_update = ? WHERE id = ?")
        .bind(checksum)
        .bind(to_db(&oais_common::time::now()))
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn find_aip<'e, E>(executor: E, id: i64) -> Result<Option<AipEntity>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {} FROM aips WHERE id = ?", AIP_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(aip_from_row).transpose()
}

pub async fn find_by_sip<'e, E>(executor: E, sip_entity_id: i64) -> Result<Vec<AipEntity>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        "SELECT {} FROM aips WHERE sip_entity_id = ? ORDER BY id",
        AIP_COLUMNS
    ))
    .bind(sip_entity_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(aip_from_row).collect()
}

/// AIPs matching update criteria (DELETED AIPs never match)
pub async fn search<'e, E>(executor: E, criteria: &SearchCriteria) -> Result<Vec<AipEntity>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut sql = format!(
        "SELECT {} FROM aips WHERE session_owner = ? AND session = ? AND state != 'DELETED'",
        AIP_COLUMNS
    );
    if criteria.state.is_some() {
        sql.push_str(" AND state = ?");
    }
    if !criteria.provider_ids.is_empty() {
        sql.push_str(&format!(
            " AND provider_id IN ({})",
            placeholders(criteria.provider_ids.len())
        ));
    }
    sql.push_str(" ORDER BY id");

    let mut query = sqlx::query(&sql)
        .bind(&criteria.session_owner)
        .bind(&criteria.session);
    if let Some(state) = criteria.state {
        query = query.bind(state.as_str());
    }
    for provider_id in &criteria.provider_ids {
        query = query.bind(provider_id);
    }

    let rows = query.fetch_all(executor).await?;
    rows.iter().map(aip_from_row).collect()
}

pub async fn delete_for_sip<'e, E>(executor: E, sip_entity_id: i64) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM aips WHERE sip_entity_id = ?")
        .bind(sip_entity_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
