//! Job worker
//!
//! Drains the tenant `jobs` table: up to `worker.slots` QUEUED jobs are
//! claimed and executed concurrently, then the next round starts. A job
//! whose handler returns an error is FAILED and its RUNNING requests go to
//! ERROR.
//!
//! Each worker claims jobs under its own owner id and renews their lease
//! while they run. Jobs whose lease ran out belong to a worker that
//! stopped; `recover` fails them the same way.

use futures::future::join_all;
use oais_common::time::now;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::run_every;
use super::RequestService;
use crate::db::jobs;
use crate::error::IngestResult;
use crate::jobs::JobExecutor;
use crate::models::{JobInfo, JobStatus};
use crate::utils::retry_on_lock;
use crate::IngestContext;

/// Error recorded on requests of a job whose worker stopped
pub const INTERRUPTED: &str = "interrupted";

#[derive(Clone)]
pub struct Worker {
    ctx: IngestContext,
    executor: JobExecutor,
    requests: RequestService,
    owner: String,
}

impl Worker {
    pub fn new(ctx: IngestContext) -> Self {
        let executor = JobExecutor::new(ctx.clone());
        let requests = RequestService::new(ctx.clone());
        let owner = format!("{}-{}", ctx.tenant, Uuid::new_v4());
        Self { ctx, executor, requests, owner }
    }

    /// Fail jobs whose lease expired; returns the requests put in ERROR
    pub async fn recover(&self) -> IngestResult<usize> {
        let stale_before = now() - self.ctx.config.worker.job_lease();
        let interrupted = jobs::fail_expired(&self.ctx.db, stale_before).await?;
        if interrupted.is_empty() {
            return Ok(0);
        }

        let mut failed = 0;
        for job in &interrupted {
            failed += self.requests.handle_job_error(job, INTERRUPTED).await?;
        }
        warn!(jobs = interrupted.len(), requests = failed, "Interrupted jobs failed");
        Ok(failed)
    }

    /// Claim and execute one round of jobs; returns how many ran
    pub async fn run_once(&self) -> IngestResult<usize> {
        let mut claimed = Vec::new();
        while claimed.len() < self.ctx.config.worker.slots {
            let db = &self.ctx.db;
            let owner = self.owner.as_str();
            let next = retry_on_lock("claim_job", self.ctx.max_lock_wait_ms(), || async move {
                jobs::claim_next_queued(db, owner).await
            })
            .await?;
            match next {
                Some(job) => claimed.push(job),
                None => break,
            }
        }

        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(jobs = claimed.len(), "Jobs claimed");

        let results = join_all(claimed.iter().map(|job| self.execute(job))).await;
        for result in results {
            result?;
        }
        Ok(claimed.len())
    }

    /// Run rounds until no QUEUED job is left
    pub async fn drain(&self) -> IngestResult<usize> {
        let mut total = 0;
        loop {
            let ran = self.run_once().await?;
            if ran == 0 {
                return Ok(total);
            }
            total += ran;
        }
    }

    async fn execute(&self, job: &JobInfo) -> IngestResult<()> {
        let db = &self.ctx.db;
        match self.execute_leased(job).await {
            Ok(()) => {
                if jobs::finish_job(db, job.id, &self.owner, JobStatus::Succeeded, None).await? {
                    debug!(job_id = job.id, "Job succeeded");
                } else {
                    warn!(job_id = job.id, "Job finished after its lease was lost");
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id = job.id, request_type = %job.request_type, error = %message, "Job failed");
                jobs::finish_job(db, job.id, &self.owner, JobStatus::Failed, Some(&message)).await?;
                self.requests.handle_job_error(job, &message).await?;
            }
        }
        Ok(())
    }

    /// Run the job handler, renewing the job lease until it returns
    async fn execute_leased(&self, job: &JobInfo) -> IngestResult<()> {
        let work = self.executor.execute(job);
        tokio::pin!(work);

        let mut heartbeat = tokio::time::interval(self.ctx.config.worker.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately, the claim already set the heartbeat
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick() => {
                    match jobs::renew_lease(&self.ctx.db, job.id, &self.owner).await {
                        Ok(true) => {}
                        Ok(false) => warn!(job_id = job.id, "Job lease lost"),
                        Err(e) => warn!(job_id = job.id, error = %e, "Job lease not renewed"),
                    }
                }
            }
        }
    }

    /// Poll for jobs until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(tenant = %self.ctx.tenant, slots = self.ctx.config.worker.slots, "Worker started");
        run_every("worker", self.ctx.config.worker.poll_interval(), cancel, || async move {
            self.drain().await.map(|_| ())
        })
        .await;
    }
}
