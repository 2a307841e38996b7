//! Asynchronous job dispatch

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::db::{jobs, requests};
use crate::error::{IngestError, IngestResult};
use crate::models::{JobHandle, JobUnit};
use crate::utils::{begin_monitored, retry_on_lock};

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Queue one unit of work; the unit carries the ids of its requests
    async fn enqueue(&self, unit: JobUnit) -> IngestResult<JobHandle>;
}

/// Queues units in the tenant database `jobs` table for the worker
pub struct DbJobDispatcher {
    db: SqlitePool,
    max_lock_wait_ms: u64,
}

impl DbJobDispatcher {
    pub fn new(db: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self { db, max_lock_wait_ms }
    }
}

#[async_trait]
impl JobDispatcher for DbJobDispatcher {
    async fn enqueue(&self, unit: JobUnit) -> IngestResult<JobHandle> {
        let db = &self.db;
        let unit = &unit;

        let job_id = retry_on_lock("enqueue_job", self.max_lock_wait_ms, || async move {
            let mut tx = begin_monitored(db, "enqueue_job").await?;
            let job_id = jobs::insert_job(tx.conn(), unit).await?;
            requests::attach_job(tx.conn(), &unit.request_ids, job_id).await?;
            tx.commit().await?;
            Ok(job_id)
        })
        .await
        .map_err(|e| IngestError::Dispatch(e.to_string()))?;

        tracing::debug!(
            job_id,
            request_type = %unit.request_type,
            requests = unit.request_ids.len(),
            "Job queued"
        );
        Ok(JobHandle { job_id })
    }
}
