//! Job persistence
//!
//! Jobs are the durable queue between the scheduler and the worker. A
//! RUNNING job belongs to the worker that claimed it for as long as that
//! worker keeps renewing its heartbeat.

use chrono::{DateTime, Utc};
use oais_common::time::{from_db, from_db_opt, now, to_db};
use oais_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite};

use crate::models::{JobInfo, JobStatus, JobUnit, RequestType};

const JOB_COLUMNS: &str = "id, request_type, chain, request_ids, status, locked, error, owner, heartbeat, \
     creation_date, last_update";

fn job_from_row(row: &SqliteRow) -> Result<JobInfo> {
    let request_type: String = row.try_get("request_type")?;
    let request_ids: String = row.try_get("request_ids")?;
    let status: String = row.try_get("status")?;
    let heartbeat: Option<String> = row.try_get("heartbeat")?;
    let creation_date: String = row.try_get("creation_date")?;
    let last_update: String = row.try_get("last_update")?;

    Ok(JobInfo {
        id: row.try_get("id")?,
        request_type: request_type.parse::<RequestType>()?,
        chain: row.try_get("chain")?,
        request_ids: serde_json::from_str(&request_ids)?,
        status: JobStatus::parse(&status)?,
        locked: row.try_get("locked")?,
        error: row.try_get("error")?,
        owner: row.try_get("owner")?,
        heartbeat: from_db_opt(heartbeat)?,
        creation_date: from_db(&creation_date)?,
        last_update: from_db(&last_update)?,
    })
}

/// Queue a unit of work
pub async fn insert_job<'e, E>(executor: E, unit: &JobUnit) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let request_ids = serde_json::to_string(&unit.request_ids)?;
    let ts = to_db(&now());

    let result = sqlx::query(
        r#"
        INSERT INTO jobs (request_type, chain, request_ids, status, locked, creation_date, last_update)
        VALUES (?, ?, ?, 'QUEUED', 0, ?, ?)
        "#,
    )
    .bind(unit.request_type.as_str())
    .bind(&unit.chain)
    .bind(&request_ids)
    .bind(&ts)
    .bind(&ts)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_job<'e, E>(executor: E, id: i64) -> Result<Option<JobInfo>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Take the oldest QUEUED job, marking it RUNNING for `owner`
pub async fn claim_next_queued<'e, E>(executor: E, owner: &str) -> Result<Option<JobInfo>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let ts = to_db(&now());
    let row = sqlx::query(&format!(
        r#"
        UPDATE jobs
        SET status = 'RUNNING', owner = ?, heartbeat = ?, last_update = ?
        WHERE id = (SELECT id FROM jobs WHERE status = 'QUEUED' ORDER BY id LIMIT 1)
          AND status = 'QUEUED'
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(owner)
    .bind(&ts)
    .bind(&ts)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Extend the lease of a RUNNING job; false once `owner` lost it
pub async fn renew_lease<'e, E>(executor: E, id: i64, owner: &str) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE jobs SET heartbeat = ? WHERE id = ? AND owner = ? AND status = 'RUNNING'",
    )
    .bind(to_db(&now()))
    .bind(id)
    .bind(owner)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record the outcome of a job RUNNING for `owner`.
///
/// Returns false when the job was not (or no longer) held by `owner`.
pub async fn finish_job<'e, E>(
    executor: E,
    id: i64,
    owner: &str,
    status: JobStatus,
    error: Option<&str>,
) -> Result<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = ?, error = ?, last_update = ?
        WHERE id = ? AND owner = ? AND status = 'RUNNING'
        "#,
    )
    .bind(status.as_str())
    .bind(error)
    .bind(to_db(&now()))
    .bind(id)
    .bind(owner)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Keep a job (and its error context) from being purged
pub async fn set_locked<'e, E>(executor: E, id: i64, locked: bool) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE jobs SET locked = ?, last_update = ? WHERE id = ?")
        .bind(locked)
        .bind(to_db(&now()))
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// RUNNING jobs whose heartbeat is older than `stale_before` become FAILED
/// and locked; returns them
pub async fn fail_expired<'e, E>(executor: E, stale_before: DateTime<Utc>) -> Result<Vec<JobInfo>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(&format!(
        r#"
        UPDATE jobs
        SET status = 'FAILED', error = 'interrupted', locked = 1, last_update = ?
        WHERE status = 'RUNNING' AND (heartbeat IS NULL OR heartbeat < ?)
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(to_db(&now()))
    .bind(to_db(&stale_before))
    .fetch_all(executor)
    .await?;

    let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>>>()?;
    jobs.sort_by_key(|j| j.id);
    Ok(jobs)
}

/// Delete finished, unlocked jobs no request points at any more
pub async fn purge_finished<'e, E>(executor: E, older_than: DateTime<Utc>) -> Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM jobs
        WHERE status IN ('SUCCEEDED', 'FAILED')
          AND locked = 0
          AND last_update < ?
          AND NOT EXISTS (SELECT 1 FROM requests r WHERE r.job_id = jobs.id)
        "#,
    )
    .bind(to_db(&older_than))
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub async fn count_by_status<'e, E>(executor: E, status: JobStatus) -> Result<i64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
        .bind(status.as_str())
        .fetch_one(executor)
        .await?;
    Ok(count)
}
