//! Remote storage result reconciler
//!
//! Storage results arrive per group id, at least once. Every RUNNING request
//! waiting on the group is advanced:
//!
//! - SUCCESS: the group id is released; once a request awaits no other
//!   group its entities move on (STORED, DELETED, manifest checksum) and
//!   the request succeeds
//! - ERROR / DENIED: SIP and AIP go to ERROR with the translated causes and
//!   the request goes to ERROR
//! - GRANTED: logged only
//!
//! Requests no longer RUNNING (or already deleted) are skipped, so replaying
//! a result is a no-op. SIPs and AIPs deleted meanwhile stay DELETED.

use oais_common::time::now;
use tracing::{debug, info, warn};

use super::deletion::delete_sip_entities;
use super::RequestService;
use crate::clients::{FileDeletionRequest, RemoteOutcome, RemoteStatus};
use crate::db::{aips, requests, sips};
use crate::error::IngestResult;
use crate::jobs::store_metadata::manifest_checksum;
use crate::jobs::update_runner::store_metadata_when_updated;
use crate::models::{AipEntity, AipState, Request, RequestPayload, RequestState, SipState};
use crate::utils::{begin_monitored, retry_on_lock};
use crate::IngestContext;

/// Error recorded when a remote step outlives its deadline
pub const REMOTE_TIMEOUT_MESSAGE: &str = "remote storage request timed out";

/// What one result batch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Requests still waiting on another group id (or only granted)
    pub waiting: usize,
    /// Requests not RUNNING any more
    pub ignored: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    ctx: IngestContext,
    requests: RequestService,
}

impl Reconciler {
    pub fn new(ctx: IngestContext) -> Self {
        let requests = RequestService::new(ctx.clone());
        Self { ctx, requests }
    }

    /// Apply one storage result batch to the requests awaiting its group id
    pub async fn handle_storage_results(&self, outcome: &RemoteOutcome) -> IngestResult<ReconcileReport> {
        let waiting = {
            let mut conn = self.ctx.db.acquire().await?;
            requests::find_by_group_id(&mut conn, &outcome.group_id).await?
        };

        let mut report = ReconcileReport::default();
        if waiting.is_empty() {
            debug!(group_id = %outcome.group_id, status = ?outcome.status, "No request awaits this group");
            return Ok(report);
        }

        for request in waiting {
            if request.state != RequestState::Running {
                debug!(
                    request_id = %request.request_id,
                    state = %request.state,
                    group_id = %outcome.group_id,
                    "Storage result ignored, request not RUNNING"
                );
                report.ignored += 1;
                continue;
            }

            match outcome.status {
                RemoteStatus::Granted => {
                    debug!(request_id = %request.request_id, group_id = %outcome.group_id, "Storage request granted");
                    report.waiting += 1;
                }
                RemoteStatus::Success => {
                    let remaining = self.release_group(&request, &outcome.group_id).await?;
                    if remaining > 0 {
                        debug!(
                            request_id = %request.request_id,
                            remaining,
                            "Storage group done, request still waiting"
                        );
                        report.waiting += 1;
                    } else {
                        self.complete(&request).await?;
                        report.succeeded.push(request.request_id.clone());
                    }
                }
                RemoteStatus::Error | RemoteStatus::Denied => {
                    if self.fail(&request, outcome.error_messages()).await? {
                        report.failed.push(request.request_id.clone());
                    } else {
                        report.ignored += 1;
                    }
                }
            }
        }

        info!(
            group_id = %outcome.group_id,
            status = ?outcome.status,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Storage results reconciled"
        );
        Ok(report)
    }

    /// Fail RUNNING requests whose remote step deadline has passed
    pub async fn expire_deadlines(&self) -> IngestResult<Vec<String>> {
        let expired = {
            let mut conn = self.ctx.db.acquire().await?;
            requests::find_expired_remote_steps(&mut conn, now()).await?
        };

        let mut failed = Vec::new();
        for request in expired {
            if self.fail(&request, vec![REMOTE_TIMEOUT_MESSAGE.to_string()]).await? {
                failed.push(request.request_id.clone());
            }
        }

        if !failed.is_empty() {
            warn!(count = failed.len(), "Remote storage requests timed out");
        }
        Ok(failed)
    }

    /// Ask the storage service for results of every group still awaited
    pub async fn poll_pending(&self) -> IngestResult<usize> {
        let group_ids = requests::pending_group_ids(&self.ctx.db).await?;

        let mut handled = 0;
        for group_id in group_ids {
            match self.ctx.storage.poll(&group_id).await {
                Ok(Some(outcome)) => {
                    self.handle_storage_results(&outcome).await?;
                    handled += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(group_id = %group_id, error = %e, "Storage result poll failed"),
            }
        }
        Ok(handled)
    }

    async fn release_group(&self, request: &Request, group_id: &str) -> IngestResult<i64> {
        let db = &self.ctx.db;
        let id = request.id;
        let remaining = retry_on_lock("release_group", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "release_group").await?;
            let remaining = requests::remove_group_id(tx.conn(), id, group_id).await?;
            tx.commit().await?;
            Ok(remaining)
        })
        .await?;
        Ok(remaining)
    }

    /// Every awaited group succeeded: move entities on, then the request
    async fn complete(&self, request: &Request) -> IngestResult<()> {
        match &request.payload {
            RequestPayload::Ingest(_) => {
                if let Some(sip_id) = request.sip_entity_id {
                    self.mark_sip_stored(sip_id).await?;
                }
                self.requests.mark_success(request).await?;
            }
            RequestPayload::AipStoreMetadata(payload) => {
                if let Some(aip_id) = request.aip_entity_id {
                    if let Some(aip) = aips::find_aip(&self.ctx.db, aip_id).await? {
                        let checksum = manifest_checksum(&aip)?;
                        if payload.remove_current {
                            self.remove_previous_manifest(&aip, &checksum).await;
                        }
                        if payload.compute_checksum {
                            aips::set_manifest_checksum(&self.ctx.db, aip.id, &checksum).await?;
                        }
                    }
                }
                self.requests.mark_success(request).await?;
            }
            RequestPayload::StorageDeletion(payload) => {
                if let Some(sip_id) = request.sip_entity_id {
                    delete_sip_entities(&self.ctx, sip_id, payload.deletion_mode).await?;
                }
                self.requests.mark_success(request).await?;
            }
            RequestPayload::AipUpdate(_) => {
                self.requests.mark_success(request).await?;
                if let Some(aip_id) = request.aip_entity_id {
                    store_metadata_when_updated(&self.ctx, &self.requests, aip_id).await?;
                }
            }
            RequestPayload::AipUpdatesCreator(_) | RequestPayload::OaisDeletion(_) => {
                self.requests.mark_success(request).await?;
            }
        }
        Ok(())
    }

    async fn mark_sip_stored(&self, sip_entity_id: i64) -> IngestResult<()> {
        let db = &self.ctx.db;
        retry_on_lock("mark_sip_stored", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "mark_sip_stored").await?;
            aips::set_state_for_sip(tx.conn(), sip_entity_id, AipState::Stored, None).await?;
            sips::set_sip_state(tx.conn(), sip_entity_id, SipState::Stored, None).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Old manifest removal is not awaited; a failure only leaves a stale copy
    async fn remove_previous_manifest(&self, aip: &AipEntity, new_checksum: &str) {
        let Some(previous) = aip.manifest_checksum.as_deref() else {
            return;
        };
        if previous == new_checksum {
            return;
        }

        let files: Vec<FileDeletionRequest> = aip
            .storages
            .iter()
            .map(|s| FileDeletionRequest {
                owner: aip.aip_id.clone(),
                session_owner: aip.session_owner.clone(),
                session: aip.session.clone(),
                checksum: previous.to_string(),
                storage: s.storage.clone(),
            })
            .collect();
        if files.is_empty() {
            return;
        }

        if let Err(e) = self.ctx.storage.delete(files).await {
            warn!(aip_id = %aip.aip_id, error = %e, "Previous manifest not removed");
        }
    }

    /// Record a remote failure on entities and request.
    ///
    /// Returns false when the request was already handled.
    async fn fail(&self, request: &Request, errors: Vec<String>) -> IngestResult<bool> {
        let db = &self.ctx.db;
        let errors_ref: &[String] = &errors;
        let sip_id = request.sip_entity_id;
        let aip_id = request.aip_entity_id;
        let whole_sip = matches!(
            request.payload,
            RequestPayload::Ingest(_) | RequestPayload::StorageDeletion(_)
        );

        retry_on_lock("remote_failure", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "remote_failure").await?;
            match (whole_sip, sip_id, aip_id) {
                (true, Some(sip_id), _) => {
                    sips::set_sip_state(tx.conn(), sip_id, SipState::Error, Some(errors_ref)).await?;
                    aips::set_state_for_sip(tx.conn(), sip_id, AipState::Error, Some(errors_ref)).await?;
                }
                (false, _, Some(aip_id)) => {
                    aips::set_aip_state(tx.conn(), aip_id, AipState::Error, Some(errors_ref)).await?;
                }
                _ => {}
            }
            tx.commit().await?;
            Ok(())
        })
        .await?;

        self.requests.mark_error(request, errors).await
    }
}
