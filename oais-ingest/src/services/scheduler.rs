//! Request scheduler
//!
//! Periodically claims a page of CREATED requests of one type, oldest
//! first, and dispatches the page as units of work. The claim is a single
//! conditional UPDATE, so concurrent ticks never hand one request to two
//! units.
//!
//! Grouping:
//! - ingest: one unit per processing chain found in the page
//! - AIP updates: the page is widened to every CREATED update of the same
//!   AIPs, so all pending updates of an AIP run in one unit
//! - everything else: one unit per page
//!
//! A unit that fails to enqueue leaves its requests RUNNING without a job;
//! [`Scheduler::reclaim`] returns those to CREATED after a timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use oais_common::events::IngestEvent;
use oais_common::time::now;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{jobs, requests};
use crate::error::IngestResult;
use crate::models::{JobUnit, Request, RequestType};
use crate::utils::{begin_monitored, retry_on_lock};
use crate::IngestContext;

/// Result of one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Requests moved to RUNNING
    pub claimed: usize,
    /// Job ids of the units enqueued
    pub jobs: Vec<i64>,
    /// Requests whose unit could not be enqueued
    pub undispatched: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: IngestContext,
}

impl Scheduler {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx }
    }

    /// Claim and dispatch one page of `request_type`
    pub async fn schedule(&self, request_type: RequestType) -> IngestResult<ScheduleReport> {
        let ids = self.claim(request_type).await?;
        if ids.is_empty() {
            return Ok(ScheduleReport::default());
        }

        let claimed = {
            let mut conn = self.ctx.db.acquire().await?;
            requests::find_by_ids(&mut conn, &ids).await?
        };

        let mut report = ScheduleReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for (unit, request_ids) in units_for(request_type, &claimed) {
            let count = unit.request_ids.len();
            match self.ctx.dispatcher.enqueue(unit.clone()).await {
                Ok(handle) => {
                    self.attach(&unit.request_ids, handle.job_id).await?;
                    report.jobs.push(handle.job_id);
                    self.ctx.event_bus.emit_lossy(IngestEvent::RequestsScheduled {
                        request_type,
                        request_ids,
                        job_id: Some(handle.job_id),
                        timestamp: now(),
                    });
                }
                Err(e) => {
                    warn!(
                        request_type = %request_type,
                        requests = count,
                        error = %e,
                        "Failed to enqueue job, requests stay RUNNING until reclaimed"
                    );
                    report.undispatched += count;
                }
            }
        }

        info!(
            request_type = %request_type,
            claimed = report.claimed,
            jobs = report.jobs.len(),
            "Scheduled requests"
        );
        Ok(report)
    }

    async fn claim(&self, request_type: RequestType) -> IngestResult<Vec<i64>> {
        let db = &self.ctx.db;
        let limit = self.ctx.page_size();
        let ids = retry_on_lock("claim_requests", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "claim_requests").await?;
            let ids = match request_type {
                RequestType::AipUpdate => requests::claim_aip_update_page(tx.conn(), limit).await?,
                other => requests::claim_page(tx.conn(), other, limit).await?,
            };
            tx.commit().await?;
            Ok(ids)
        })
        .await?;

        if !ids.is_empty() {
            debug!(request_type = %request_type, count = ids.len(), "Claimed requests");
        }
        Ok(ids)
    }

    async fn attach(&self, ids: &[i64], job_id: i64) -> IngestResult<()> {
        let db = &self.ctx.db;
        retry_on_lock("attach_job", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "attach_job").await?;
            requests::attach_job(tx.conn(), ids, job_id).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Return RUNNING requests that never got a job to CREATED
    pub async fn reclaim(&self) -> IngestResult<Vec<String>> {
        let cutoff = now() - self.ctx.config.scheduler.reclaim_timeout();
        let db = &self.ctx.db;
        let reclaimed = retry_on_lock("reclaim_requests", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "reclaim_requests").await?;
            let reclaimed = requests::reclaim_unassigned(tx.conn(), cutoff).await?;
            tx.commit().await?;
            Ok(reclaimed)
        })
        .await?;

        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "Reclaimed RUNNING requests without a job");
            self.ctx.event_bus.emit_lossy(IngestEvent::RequestsReclaimed {
                request_ids: reclaimed.clone(),
                timestamp: now(),
            });
        }
        Ok(reclaimed)
    }

    /// Drop finished jobs nothing refers to any more
    pub async fn purge_jobs(&self) -> IngestResult<u64> {
        let purged = jobs::purge_finished(&self.ctx.db, now()).await?;
        if purged > 0 {
            debug!(purged, "Purged finished jobs");
        }
        Ok(purged)
    }
}

/// Split a claimed page into units; each unit comes with its external ids
fn units_for(request_type: RequestType, claimed: &[Request]) -> Vec<(JobUnit, Vec<String>)> {
    if request_type == RequestType::Ingest {
        let mut by_chain: BTreeMap<String, Vec<&Request>> = BTreeMap::new();
        for request in claimed {
            let chain = request
                .ingest_payload()
                .map(|p| p.metadata.chain.clone())
                .unwrap_or_default();
            by_chain.entry(chain).or_default().push(request);
        }
        by_chain
            .into_iter()
            .map(|(chain, batch)| {
                (
                    JobUnit {
                        request_type,
                        chain: Some(chain),
                        request_ids: batch.iter().map(|r| r.id).collect(),
                    },
                    batch.iter().map(|r| r.request_id.clone()).collect(),
                )
            })
            .collect()
    } else {
        vec![(
            JobUnit {
                request_type,
                chain: None,
                request_ids: claimed.iter().map(|r| r.id).collect(),
            },
            claimed.iter().map(|r| r.request_id.clone()).collect(),
        )]
    }
}

/// Run `tick` every `period` until cancelled; tick errors are logged
pub async fn run_every<F, Fut>(name: &'static str, period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IngestResult<()>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(task = name, "Periodic task stopped");
                return;
            }
            _ = interval.tick() => {
                if let Err(e) = tick().await {
                    error!(task = name, error = %e, "Periodic task failed");
                }
            }
        }
    }
}
