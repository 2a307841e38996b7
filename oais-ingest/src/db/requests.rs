//! Request persistence
//!
//! State-changing statements here are conditional on the current state
//! (`... WHERE state = ?`) so concurrent schedulers, workers and callbacks
//! can never apply the same transition twice.

use chrono::{DateTime, Utc};
use oais_common::time::{from_db, from_db_opt, now, to_db};
use oais_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqliteConnection};

use crate::models::{Request, RequestState, RequestType};
use crate::policy::{RequestScope, ScopedRequest};

use super::placeholders;

const REQUEST_COLUMNS: &str = "id, request_id, request_type, state, session_owner, session, \
                               provider_id, sip_entity_id, aip_entity_id, job_id, payload, errors, \
                               remote_step_deadline, creation_date, last_update";

/// Search filters; `None` matches everything
#[derive(Debug, Clone, Default)]
pub struct RequestFilters {
    pub request_type: Option<RequestType>,
    pub state: Option<RequestState>,
    pub session_owner: Option<String>,
    pub session: Option<String>,
    pub provider_id: Option<String>,
}

fn request_from_row(row: &SqliteRow) -> Result<Request> {
    let state: String = row.try_get("state")?;
    let payload: String = row.try_get("payload")?;
    let errors: String = row.try_get("errors")?;
    let creation_date: String = row.try_get("creation_date")?;
    let last_update: String = row.try_get("last_update")?;

    Ok(Request {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        state: state.parse()?,
        session_owner: row.try_get("session_owner")?,
        session: row.try_get("session")?,
        provider_id: row.try_get("provider_id")?,
        sip_entity_id: row.try_get("sip_entity_id")?,
        aip_entity_id: row.try_get("aip_entity_id")?,
        job_id: row.try_get("job_id")?,
        payload: serde_json::from_str(&payload)?,
        errors: serde_json::from_str(&errors)?,
        group_ids: Vec::new(),
        remote_step_deadline: from_db_opt(row.try_get("remote_step_deadline")?)?,
        creation_date: from_db(&creation_date)?,
        last_update: from_db(&last_update)?,
    })
}

fn scoped_from_row(row: &SqliteRow) -> Result<ScopedRequest> {
    let request_type: String = row.try_get("request_type")?;
    let request_type: RequestType = request_type.parse()?;
    let state: String = row.try_get("state")?;
    let session_owner: String = row.try_get("session_owner")?;
    let session: String = row.try_get("session")?;

    Ok(ScopedRequest {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        request_type,
        state: state.parse()?,
        scope: RequestScope::for_request(
            request_type,
            &session_owner,
            &session,
            row.try_get("sip_entity_id")?,
            row.try_get("aip_entity_id")?,
        ),
    })
}

async fn attach_group_ids(conn: &mut SqliteConnection, requests: &mut [Request]) -> Result<()> {
    for request in requests.iter_mut() {
        request.group_ids =
            sqlx::query_scalar("SELECT group_id FROM request_group_ids WHERE request_id = ? ORDER BY group_id")
                .bind(request.id)
                .fetch_all(&mut *conn)
                .await?;
    }
    Ok(())
}

/// Insert a request and its group ids, returning the surrogate id
pub async fn insert_request(conn: &mut SqliteConnection, request: &Request) -> Result<i64> {
    let payload = serde_json::to_string(&request.payload)?;
    let errors = serde_json::to_string(&request.errors)?;

    let result = sqlx::query(
        r#"
        INSERT INTO requests (
            request_id, request_type, state, session_owner, session, provider_id,
            sip_entity_id, aip_entity_id, job_id, payload, errors,
            remote_step_deadline, creation_date, last_update
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&request.request_id)
    .bind(request.request_type().as_str())
    .bind(request.state.as_str())
    .bind(&request.session_owner)
    .bind(&request.session)
    .bind(&request.provider_id)
    .bind(request.sip_entity_id)
    .bind(request.aip_entity_id)
    .bind(request.job_id)
    .bind(&payload)
    .bind(&errors)
    .bind(request.remote_step_deadline.as_ref().map(to_db))
    .bind(to_db(&request.creation_date))
    .bind(to_db(&request.last_update))
    .execute(&mut *conn)
    .await?;

    let id = result.last_insert_rowid();
    for group_id in &request.group_ids {
        add_group_id(&mut *conn, id, group_id).await?;
    }
    Ok(id)
}

pub async fn find_request(conn: &mut SqliteConnection, id: i64) -> Result<Option<Request>> {
    let row = sqlx::query(&format!("SELECT {} FROM requests WHERE id = ?", REQUEST_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => {
            let mut requests = vec![request_from_row(&row)?];
            attach_group_ids(conn, &mut requests).await?;
            Ok(requests.pop())
        }
        None => Ok(None),
    }
}

pub async fn find_by_request_id(conn: &mut SqliteConnection, request_id: &str) -> Result<Option<Request>> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM requests WHERE request_id = ?")
        .bind(request_id)
        .fetch_optional(&mut *conn)
        .await?;

    match id {
        Some(id) => find_request(conn, id).await,
        None => Ok(None),
    }
}

/// Requests by surrogate id, in id order (missing ids are skipped)
pub async fn find_by_ids(conn: &mut SqliteConnection, ids: &[i64]) -> Result<Vec<Request>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {} FROM requests WHERE id IN ({}) ORDER BY id",
        REQUEST_COLUMNS,
        placeholders(ids.len())
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&mut *conn).await?;

    let mut requests = rows.iter().map(request_from_row).collect::<Result<Vec<_>>>()?;
    attach_group_ids(conn, &mut requests).await?;
    Ok(requests)
}

/// Requests waiting on a remote group id
pub async fn find_by_group_id(conn: &mut SqliteConnection, group_id: &str) -> Result<Vec<Request>> {
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT request_id FROM request_group_ids WHERE group_id = ? ORDER BY request_id")
            .bind(group_id)
            .fetch_all(&mut *conn)
            .await?;

    find_by_ids(conn, &ids).await
}

pub async fn search(
    conn: &mut SqliteConnection,
    filters: &RequestFilters,
    limit: i64,
    offset: i64,
) -> Result<Vec<Request>> {
    let mut sql = format!("SELECT {} FROM requests WHERE 1 = 1", REQUEST_COLUMNS);
    let mut binds: Vec<String> = Vec::new();

    if let Some(t) = filters.request_type {
        sql.push_str(" AND request_type = ?");
        binds.push(t.as_str().to_string());
    }
    if let Some(s) = filters.state {
        sql.push_str(" AND state = ?");
        binds.push(s.as_str().to_string());
    }
    if let Some(owner) = &filters.session_owner {
        sql.push_str(" AND session_owner = ?");
        binds.push(owner.clone());
    }
    if let Some(session) = &filters.session {
        sql.push_str(" AND session = ?");
        binds.push(session.clone());
    }
    if let Some(provider_id) = &filters.provider_id {
        sql.push_str(" AND provider_id = ?");
        binds.push(provider_id.clone());
    }
    sql.push_str(" ORDER BY id LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql);
    for value in &binds {
        query = query.bind(value);
    }
    let rows = query.bind(limit).bind(offset).fetch_all(&mut *conn).await?;

    let mut requests = rows.iter().map(request_from_row).collect::<Result<Vec<_>>>()?;
    attach_group_ids(conn, &mut requests).await?;
    Ok(requests)
}

pub async fn count_by_state<'e, E>(
    executor: E,
    request_type: RequestType,
    state: RequestState,
) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE request_type = ? AND state = ?")
        .bind(request_type.as_str())
        .bind(state.as_str())
        .fetch_one(executor)
        .await?;
    Ok(count)
}

/// Non-terminal requests of a session, as policy input
pub async fn find_live_in_session<'e, E>(
    executor: E,
    session_owner: &str,
    session: &str,
) -> Result<Vec<ScopedRequest>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, request_id, request_type, state, session_owner, session, sip_entity_id, aip_entity_id
        FROM requests
        WHERE session_owner = ? AND session = ? AND state IN ('CREATED', 'RUNNING', 'BLOCKED')
        ORDER BY id
        "#,
    )
    .bind(session_owner)
    .bind(session)
    .fetch_all(executor)
    .await?;

    rows.iter().map(scoped_from_row).collect()
}

/// BLOCKED requests (optionally of one type), oldest first
pub async fn find_blocked<'e, E>(
    executor: E,
    request_type: Option<RequestType>,
) -> Result<Vec<ScopedRequest>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, request_id, request_type, state, session_owner, session, sip_entity_id, aip_entity_id
        FROM requests
        WHERE state = 'BLOCKED' AND (? IS NULL OR request_type = ?)
        ORDER BY id
        "#,
    )
    .bind(request_type.map(|t| t.as_str()))
    .bind(request_type.map(|t| t.as_str()))
    .fetch_all(executor)
    .await?;

    rows.iter().map(scoped_from_row).collect()
}

/// Conditional transition; returns true when the row was in `from`
pub async fn transition<'e, E>(
    executor: E,
    id: i64,
    from: RequestState,
    to: RequestState,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE requests SET state = ?, last_update = ? WHERE id = ? AND state = ?")
        .bind(to.as_str())
        .bind(to_db(&now()))
        .bind(id)
        .bind(from.as_str())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// RUNNING → ERROR with the error list; false when not RUNNING
pub async fn set_error<'e, E>(executor: E, id: i64, errors: &[String]) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let errors = serde_json::to_string(errors)?;
    let result = sqlx::query(
        "UPDATE requests SET state = 'ERROR', errors = ?, last_update = ? WHERE id = ? AND state = 'RUNNING'",
    )
    .bind(&errors)
    .bind(to_db(&now()))
    .bind(id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// ERROR → `to` with errors, job and remote tracking cleared
pub async fn reset_for_retry(
    conn: &mut SqliteConnection,
    request: &Request,
    to: RequestState,
) -> Result<bool> {
    let payload = serde_json::to_string(&request.payload)?;
    let result = sqlx::query(
        r#"
        UPDATE requests
        SET state = ?, errors = '[]', job_id = NULL, remote_step_deadline = NULL,
            payload = ?, last_update = ?
        WHERE id = ? AND state = 'ERROR'
        "#,
    )
    .bind(to.as_str())
    .bind(&payload)
    .bind(to_db(&now()))
    .bind(request.id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        clear_group_ids(conn, request.id).await?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Persist payload, entity references and remote deadline
pub async fn update_details<'e, E>(executor: E, request: &Request) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(&request.payload)?;
    sqlx::query(
        r#"
        UPDATE requests
        SET payload = ?, provider_id = ?, sip_entity_id = ?, aip_entity_id = ?,
            remote_step_deadline = ?, last_update = ?
        WHERE id = ?
        "#,
    )
    .bind(&payload)
    .bind(&request.provider_id)
    .bind(request.sip_entity_id)
    .bind(request.aip_entity_id)
    .bind(request.remote_step_deadline.as_ref().map(to_db))
    .bind(to_db(&now()))
    .bind(request.id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_request(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    clear_group_ids(&mut *conn, id).await?;
    let result = sqlx::query("DELETE FROM requests WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn add_group_id<'e, E>(executor: E, id: i64, group_id: &str) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO request_group_ids (request_id, group_id) VALUES (?, ?)")
        .bind(id)
        .bind(group_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Remove one awaited group id; returns how many are still awaited
pub async fn remove_group_id(conn: &mut SqliteConnection, id: i64, group_id: &str) -> Result<i64> {
    sqlx::query("DELETE FROM request_group_ids WHERE request_id = ? AND group_id = ?")
        .bind(id)
        .bind(group_id)
        .execute(&mut *conn)
        .await?;

    let remaining = sqlx::query_scalar("SELECT COUNT(*) FROM request_group_ids WHERE request_id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(remaining)
}

pub async fn clear_group_ids<'e, E>(executor: E, id: i64) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM request_group_ids WHERE request_id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Claim up to `limit` CREATED requests of a type, oldest first.
///
/// Single conditional UPDATE: a row claimed by a concurrent scan is no
/// longer CREATED and cannot be returned twice.
pub async fn claim_page(
    conn: &mut SqliteConnection,
    request_type: RequestType,
    limit: i64,
) -> Result<Vec<i64>> {
    let mut ids: Vec<i64> = sqlx::query_scalar(
        r#"
        UPDATE requests
        SET state = 'RUNNING', last_update = ?
        WHERE id IN (
            SELECT id FROM requests
            WHERE request_type = ? AND state = 'CREATED'
            ORDER BY id
            LIMIT ?
        )
        AND state = 'CREATED'
        RETURNING id
        "#,
    )
    .bind(to_db(&now()))
    .bind(request_type.as_str())
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    ids.sort_unstable();
    Ok(ids)
}

/// Claim a page of AIP updates, then every other CREATED update on the
/// same AIPs. AIPs already having a RUNNING update are skipped so two units
/// of work never touch one AIP.
pub async fn claim_aip_update_page(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<i64>> {
    let claimed: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        UPDATE requests
        SET state = 'RUNNING', last_update = ?
        WHERE id IN (
            SELECT r.id FROM requests r
            WHERE r.request_type = 'AIP_UPDATE' AND r.state = 'CREATED'
              AND NOT EXISTS (
                  SELECT 1 FROM requests o
                  WHERE o.request_type = 'AIP_UPDATE' AND o.state = 'RUNNING'
                    AND o.aip_entity_id = r.aip_entity_id
              )
            ORDER BY r.id
            LIMIT ?
        )
        AND state = 'CREATED'
        RETURNING id, aip_entity_id
        "#,
    )
    .bind(to_db(&now()))
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    if claimed.is_empty() {
        return Ok(Vec::new());
    }

    let mut aip_ids: Vec<i64> = claimed.iter().map(|(_, aip)| *aip).collect();
    aip_ids.sort_unstable();
    aip_ids.dedup();

    let sql = format!(
        r#"
        UPDATE requests
        SET state = 'RUNNING', last_update = ?
        WHERE request_type = 'AIP_UPDATE' AND state = 'CREATED' AND aip_entity_id IN ({})
        RETURNING id
        "#,
        placeholders(aip_ids.len())
    );
    let mut query = sqlx::query_scalar(&sql).bind(to_db(&now()));
    for aip_id in &aip_ids {
        query = query.bind(aip_id);
    }
    let siblings: Vec<i64> = query.fetch_all(&mut *conn).await?;

    let mut ids: Vec<i64> = claimed.into_iter().map(|(id, _)| id).chain(siblings).collect();
    ids.sort_unstable();
    Ok(ids)
}

/// Record the job on RUNNING requests that don't have one yet
pub async fn attach_job(conn: &mut SqliteConnection, ids: &[i64], job_id: i64) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE requests SET job_id = ? WHERE job_id IS NULL AND state = 'RUNNING' AND id IN ({})",
        placeholders(ids.len())
    );
    let mut query = sqlx::query(&sql).bind(job_id);
    for id in ids {
        query = query.bind(id);
    }
    Ok(query.execute(&mut *conn).await?.rows_affected())
}

/// RUNNING requests with no job older than `cutoff` go back to CREATED
pub async fn reclaim_unassigned(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        r#"
        UPDATE requests
        SET state = 'CREATED', last_update = ?
        WHERE state = 'RUNNING' AND job_id IS NULL AND last_update < ?
        RETURNING request_id
        "#,
    )
    .bind(to_db(&now()))
    .bind(to_db(&cutoff))
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// RUNNING requests whose remote step deadline has passed
pub async fn find_expired_remote_steps(conn: &mut SqliteConnection, at: DateTime<Utc>) -> Result<Vec<Request>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM requests
        WHERE state = 'RUNNING' AND remote_step_deadline IS NOT NULL AND remote_step_deadline < ?
        ORDER BY id
        "#,
    )
    .bind(to_db(&at))
    .fetch_all(&mut *conn)
    .await?;

    find_by_ids(conn, &ids).await
}

/// RUNNING AIP updates on an AIP
pub async fn count_running_updates_for_aip<'e, E>(executor: E, aip_entity_id: i64) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM requests WHERE request_type = 'AIP_UPDATE' AND state = 'RUNNING' AND aip_entity_id = ?",
    )
    .bind(aip_entity_id)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

/// Job attached to a request, if any
pub async fn job_id_of<'e, E>(executor: E, id: i64) -> Result<Option<i64>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let job_id: Option<Option<i64>> = sqlx::query_scalar("SELECT job_id FROM requests WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(job_id.flatten())
}

/// Distinct group ids awaited by RUNNING requests
pub async fn pending_group_ids<'e, E>(executor: E) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let group_ids = sqlx::query_scalar(
        r#"
        SELECT DISTINCT g.group_id
        FROM request_group_ids g
        JOIN requests r ON r.id = g.request_id
        WHERE r.state = 'RUNNING'
        ORDER BY g.group_id
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(group_ids)
}
