//! Job execution
//!
//! A job carries the ids of the requests one scheduler page dispatched. The
//! executor reloads those still RUNNING and hands them to the handler of
//! their type. Handlers report per request (success, error, or waiting on a
//! remote group); an `Err` from a handler means the job failed as a whole.

pub mod oais_deletion;
pub mod storage_deletion;
pub mod store_metadata;
pub mod update_runner;
pub mod updates_creator;

use chrono::{DateTime, Utc};
use oais_common::time::deadline_in_minutes;
use tracing::{debug, info};

use crate::chain::ChainRunner;
use crate::error::IngestResult;
use crate::models::{JobInfo, Request, RequestState, RequestType};
use crate::services::RequestService;
use crate::IngestContext;

#[derive(Clone)]
pub struct JobExecutor {
    ctx: IngestContext,
    requests: RequestService,
}

impl JobExecutor {
    pub fn new(ctx: IngestContext) -> Self {
        let requests = RequestService::new(ctx.clone());
        Self { ctx, requests }
    }

    pub async fn execute(&self, job: &JobInfo) -> IngestResult<()> {
        let batch: Vec<Request> = self
            .requests
            .find_by_ids(&job.request_ids)
            .await?
            .into_iter()
            .filter(|r| r.state == RequestState::Running)
            .collect();

        if batch.is_empty() {
            debug!(job_id = job.id, "No RUNNING request left in job");
            return Ok(());
        }

        info!(
            job_id = job.id,
            request_type = %job.request_type,
            requests = batch.len(),
            "Executing job"
        );

        match job.request_type {
            RequestType::Ingest => {
                let chain = job
                    .chain
                    .clone()
                    .unwrap_or_else(|| self.ctx.config.ingest.default_chain.clone());
                ChainRunner::new(self.ctx.clone())
                    .run(&chain, Some(job.id), batch)
                    .await?;
            }
            RequestType::AipUpdatesCreator => {
                updates_creator::run(&self.ctx, &self.requests, batch).await?
            }
            RequestType::AipUpdate => update_runner::run(&self.ctx, &self.requests, batch).await?,
            RequestType::AipStoreMetadata => {
                store_metadata::run(&self.ctx, &self.requests, batch).await?
            }
            RequestType::OaisDeletion => oais_deletion::run(&self.ctx, &self.requests, batch).await?,
            RequestType::StorageDeletion => {
                storage_deletion::run(&self.ctx, &self.requests, batch).await?
            }
        }
        Ok(())
    }
}

/// Deadline for a remote step started now
pub(crate) fn remote_deadline(ctx: &IngestContext) -> IngestResult<DateTime<Utc>> {
    Ok(deadline_in_minutes(ctx.config.ingest.remote_request_timeout_minutes)?)
}

/// Make every request of `batch` wait on `group_id` until the deadline
pub(crate) async fn await_remote(
    ctx: &IngestContext,
    requests: &RequestService,
    batch: &mut [Request],
    group_id: &str,
) -> IngestResult<()> {
    let deadline = remote_deadline(ctx)?;
    for request in batch.iter_mut() {
        request.remote_step_deadline = Some(deadline);
        requests.await_group(request, group_id).await?;
    }
    Ok(())
}
