//! Request lifecycle manager
//!
//! Owns every request state transition:
//!
//! ```text
//! register ──► CREATED ──► RUNNING ──► (deleted on success)
//!    │            ▲           │
//!    ▼            │           ▼
//! BLOCKED ──unblock┘        ERROR ──retry──► CREATED | BLOCKED
//! ```
//!
//! Each transition is one conditional write in its own transaction, retried
//! on SQLite lock contention, followed by a lifecycle event on the bus and a
//! session progress notification.

use std::collections::BTreeMap;

use oais_common::events::{IngestEvent, SessionStep};
use oais_common::time::now;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::SessionNotification;
use crate::db::requests::{self, RequestFilters};
use crate::db::{aips, jobs, sips};
use crate::error::{IngestError, IngestResult};
use crate::models::{
    IngestStep, JobInfo, Request, RequestDraft, RequestPayload, RequestState, RequestTarget,
    RequestType,
};
use crate::policy::{self, Decision, RequestScope};
use crate::utils::{begin_monitored, retry_on_lock};
use crate::IngestContext;

/// Outcome of [`RequestService::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Registered {
        id: i64,
        request_id: String,
        state: RequestState,
    },
    /// Refused; nothing was persisted
    Denied { reasons: Vec<String> },
}

impl Registration {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Registration::Registered { request_id, .. } => Some(request_id),
            Registration::Denied { .. } => None,
        }
    }

    pub fn state(&self) -> Option<RequestState> {
        match self {
            Registration::Registered { state, .. } => Some(*state),
            Registration::Denied { .. } => None,
        }
    }
}

/// Session and entity references a draft resolves to
struct ResolvedTarget {
    session_owner: String,
    session: String,
    provider_id: Option<String>,
    sip_entity_id: Option<i64>,
    aip_entity_id: Option<i64>,
}

#[derive(Clone)]
pub struct RequestService {
    ctx: IngestContext,
}

impl RequestService {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx }
    }

    /// Validate, persist and evaluate a new request.
    ///
    /// Invalid payloads and unknown targets are denied without being
    /// persisted. Otherwise the request is stored CREATED, or BLOCKED when
    /// a conflicting request of its session holds it back.
    pub async fn register(&self, draft: RequestDraft) -> IngestResult<Registration> {
        let request_type = draft.request_type();

        let mut reasons = draft.payload.validate();
        if let RequestPayload::Ingest(p) = &draft.payload {
            if !self.ctx.chains.contains(&p.metadata.chain) {
                reasons.push(format!("Unknown processing chain: {}", p.metadata.chain));
            }
        }

        let target = match self.resolve_target(&draft).await? {
            Ok(target) => target,
            Err(reason) => {
                reasons.push(reason);
                return Ok(self.deny(&draft, None, reasons));
            }
        };
        if !reasons.is_empty() {
            return Ok(self.deny(&draft, Some(&target), reasons));
        }

        let ts = now();
        let mut request = Request {
            id: 0,
            request_id: Uuid::new_v4().to_string(),
            state: RequestState::Blocked,
            session_owner: target.session_owner,
            session: target.session,
            provider_id: target.provider_id,
            sip_entity_id: target.sip_entity_id,
            aip_entity_id: target.aip_entity_id,
            job_id: None,
            payload: draft.payload,
            errors: Vec::new(),
            group_ids: Vec::new(),
            remote_step_deadline: None,
            creation_date: ts,
            last_update: ts,
        };
        let scope = RequestScope::for_request(
            request_type,
            &request.session_owner,
            &request.session,
            request.sip_entity_id,
            request.aip_entity_id,
        );

        let db = &self.ctx.db;
        let pending = &request;
        let scope = &scope;
        let (id, state, blocker) =
            retry_on_lock("register_request", self.ctx.max_lock_wait_ms(), || async move {
                let mut tx = begin_monitored(db, "register_request").await?;
                let id = requests::insert_request(tx.conn(), pending).await?;
                let live = requests::find_live_in_session(
                    tx.conn(),
                    &pending.session_owner,
                    &pending.session,
                )
                .await?;

                let blocker = policy::first_conflict(id, request_type, scope, &live)
                    .map(|r| r.request_id.clone());
                let state = if blocker.is_none() {
                    requests::transition(tx.conn(), id, RequestState::Blocked, RequestState::Created)
                        .await?;
                    RequestState::Created
                } else {
                    RequestState::Blocked
                };
                tx.commit().await?;
                Ok((id, state, blocker))
            })
            .await?;

        request.id = id;
        request.state = state;

        match &blocker {
            Some(blocker) => debug!(
                request_id = %request.request_id,
                request_type = %request_type,
                blocked_by = %blocker,
                "Request registered BLOCKED"
            ),
            None => debug!(
                request_id = %request.request_id,
                request_type = %request_type,
                "Request registered CREATED"
            ),
        }

        self.ctx.event_bus.emit_lossy(IngestEvent::RequestRegistered {
            request_id: request.request_id.clone(),
            request_type,
            state,
            session_owner: request.session_owner.clone(),
            session: request.session.clone(),
            provider_id: request.provider_id.clone(),
            timestamp: now(),
        });
        self.notify(&request.session_owner, &request.session, SessionStep::Granted, request_type, 1);

        Ok(Registration::Registered {
            id,
            request_id: request.request_id,
            state,
        })
    }

    /// Resolve the target; the inner `Err` is a denial reason
    async fn resolve_target(
        &self,
        draft: &RequestDraft,
    ) -> IngestResult<Result<ResolvedTarget, String>> {
        let db = &self.ctx.db;
        let resolved = match &draft.target {
            RequestTarget::Session { session_owner, session } => Ok(ResolvedTarget {
                session_owner: session_owner.clone(),
                session: session.clone(),
                provider_id: match &draft.payload {
                    RequestPayload::Ingest(p) => Some(p.sip.provider_id.clone()),
                    _ => None,
                },
                sip_entity_id: None,
                aip_entity_id: None,
            }),
            RequestTarget::Sip(id) => match sips::find_sip(db, *id).await? {
                Some(sip) => Ok(ResolvedTarget {
                    session_owner: sip.session_owner,
                    session: sip.session,
                    provider_id: Some(sip.provider_id),
                    sip_entity_id: Some(sip.id),
                    aip_entity_id: None,
                }),
                None => Err(format!("SIP {} not found", id)),
            },
            RequestTarget::Aip(id) => match aips::find_aip(db, *id).await? {
                Some(aip) => Ok(ResolvedTarget {
                    session_owner: aip.session_owner,
                    session: aip.session,
                    provider_id: Some(aip.provider_id),
                    sip_entity_id: Some(aip.sip_entity_id),
                    aip_entity_id: Some(aip.id),
                }),
                None => Err(format!("AIP {} not found", id)),
            },
        };
        Ok(resolved)
    }

    fn deny(
        &self,
        draft: &RequestDraft,
        target: Option<&ResolvedTarget>,
        reasons: Vec<String>,
    ) -> Registration {
        let request_type = draft.request_type();
        let (session_owner, session) = match (target, &draft.target) {
            (Some(t), _) => (t.session_owner.clone(), t.session.clone()),
            (None, RequestTarget::Session { session_owner, session }) => {
                (session_owner.clone(), session.clone())
            }
            (None, _) => (String::new(), String::new()),
        };
        let provider_id = match &draft.payload {
            RequestPayload::Ingest(p) => Some(p.sip.provider_id.clone()),
            _ => target.and_then(|t| t.provider_id.clone()),
        };

        info!(
            request_type = %request_type,
            reasons = %reasons.join("; "),
            "Request denied"
        );
        self.ctx.event_bus.emit_lossy(IngestEvent::RequestDenied {
            request_type,
            session_owner: session_owner.clone(),
            session: session.clone(),
            provider_id,
            reasons: reasons.clone(),
            timestamp: now(),
        });
        self.notify(&session_owner, &session, SessionStep::Denied, request_type, 1);

        Registration::Denied { reasons }
    }

    /// CREATED → RUNNING; ids not in CREATED are left alone.
    ///
    /// Returns the ids actually transitioned.
    pub async fn mark_running(&self, ids: &[i64]) -> IngestResult<Vec<i64>> {
        let db = &self.ctx.db;
        let marked = retry_on_lock("mark_running", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "mark_running").await?;
            let mut marked = Vec::new();
            for id in ids {
                if requests::transition(tx.conn(), *id, RequestState::Created, RequestState::Running)
                    .await?
                {
                    marked.push(*id);
                }
            }
            tx.commit().await?;
            Ok(marked)
        })
        .await?;

        debug!(requested = ids.len(), marked = marked.len(), "Requests marked RUNNING");
        Ok(marked)
    }

    /// Remove a completed request and wake up whatever it was blocking
    pub async fn mark_success(&self, request: &Request) -> IngestResult<()> {
        let db = &self.ctx.db;
        let id = request.id;
        let deleted = retry_on_lock("mark_success", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "mark_success").await?;
            let deleted = requests::delete_request(tx.conn(), id).await?;
            tx.commit().await?;
            Ok(deleted)
        })
        .await?;

        if !deleted {
            debug!(request_id = %request.request_id, "Request already completed");
            return Ok(());
        }

        let request_type = request.request_type();
        debug!(request_id = %request.request_id, request_type = %request_type, "Request succeeded");
        self.ctx.event_bus.emit_lossy(IngestEvent::RequestSucceeded {
            request_id: request.request_id.clone(),
            request_type,
            session_owner: request.session_owner.clone(),
            session: request.session.clone(),
            provider_id: request.provider_id.clone(),
            timestamp: now(),
        });
        self.notify(&request.session_owner, &request.session, SessionStep::Success, request_type, 1);

        self.unblock(None).await?;
        Ok(())
    }

    /// RUNNING → ERROR, keeping the request and locking its job.
    ///
    /// Returns false when the request was not RUNNING (already handled).
    pub async fn mark_error(&self, request: &Request, errors: Vec<String>) -> IngestResult<bool> {
        let db = &self.ctx.db;
        let id = request.id;
        let job_id = request.job_id;
        let errors_ref = &errors;
        let changed = retry_on_lock("mark_error", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "mark_error").await?;
            let changed = requests::set_error(tx.conn(), id, errors_ref).await?;
            if changed {
                let job_id = match job_id {
                    Some(job_id) => Some(job_id),
                    None => requests::job_id_of(tx.conn(), id).await?,
                };
                if let Some(job_id) = job_id {
                    jobs::set_locked(tx.conn(), job_id, true).await?;
                }
            }
            tx.commit().await?;
            Ok(changed)
        })
        .await?;

        if !changed {
            debug!(request_id = %request.request_id, "Request not RUNNING, error ignored");
            return Ok(false);
        }

        let request_type = request.request_type();
        warn!(
            request_id = %request.request_id,
            request_type = %request_type,
            errors = %errors.join("; "),
            "Request failed"
        );
        self.ctx.event_bus.emit_lossy(IngestEvent::RequestFailed {
            request_id: request.request_id.clone(),
            request_type,
            session_owner: request.session_owner.clone(),
            session: request.session.clone(),
            provider_id: request.provider_id.clone(),
            errors,
            timestamp: now(),
        });
        self.notify(&request.session_owner, &request.session, SessionStep::Error, request_type, 1);
        Ok(true)
    }

    /// Promote BLOCKED requests (of one type, or all) that no longer conflict.
    ///
    /// One pass, oldest first, in a single transaction; safe to run while
    /// other requests are being registered.
    pub async fn unblock(&self, request_type: Option<RequestType>) -> IngestResult<Vec<String>> {
        let db = &self.ctx.db;
        let promoted = retry_on_lock("unblock_requests", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "unblock_requests").await?;
            let blocked = requests::find_blocked(tx.conn(), request_type).await?;

            let mut by_session: BTreeMap<(String, String), Vec<i64>> = BTreeMap::new();
            let mut request_ids = BTreeMap::new();
            for candidate in &blocked {
                let (owner, session) = match &candidate.scope {
                    RequestScope::Session { session_owner, session }
                    | RequestScope::Sip { session_owner, session, .. }
                    | RequestScope::Aip { session_owner, session, .. } => {
                        (session_owner.clone(), session.clone())
                    }
                };
                by_session.entry((owner, session)).or_default().push(candidate.id);
                request_ids.insert(candidate.id, candidate.request_id.clone());
            }

            let mut promoted = Vec::new();
            for ((owner, session), ids) in by_session {
                let mut live = requests::find_live_in_session(tx.conn(), &owner, &session).await?;
                for id in policy::resolve_blocked(&ids, &mut live) {
                    if requests::transition(tx.conn(), id, RequestState::Blocked, RequestState::Created)
                        .await?
                    {
                        if let Some(request_id) = request_ids.get(&id) {
                            promoted.push(request_id.clone());
                        }
                    }
                }
            }
            tx.commit().await?;
            Ok(promoted)
        })
        .await?;

        if !promoted.is_empty() {
            info!(count = promoted.len(), "Unblocked requests");
            self.ctx.event_bus.emit_lossy(IngestEvent::RequestsUnblocked {
                request_ids: promoted.clone(),
                timestamp: now(),
            });
        }
        Ok(promoted)
    }

    /// Put ERROR requests back into the pipeline.
    ///
    /// Each request goes through the conflict policy again and lands in
    /// CREATED or BLOCKED; errors, remote tracking and the job link are
    /// cleared and the old job is unlocked. Non-ERROR ids are skipped.
    pub async fn retry(&self, ids: &[i64]) -> IngestResult<Vec<String>> {
        let db = &self.ctx.db;
        let retried = retry_on_lock("retry_requests", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "retry_requests").await?;
            let mut retried = Vec::new();

            let found = requests::find_by_ids(tx.conn(), ids).await?;
            for mut request in found {
                if request.state != RequestState::Error {
                    warn!(
                        request_id = %request.request_id,
                        state = %request.state,
                        "Only ERROR requests can be retried"
                    );
                    continue;
                }
                let old_job = request.job_id;
                request.set_ingest_step(IngestStep::LocalScheduled, None);

                let live = requests::find_live_in_session(
                    tx.conn(),
                    &request.session_owner,
                    &request.session,
                )
                .await?;
                let scope = RequestScope::for_request(
                    request.request_type(),
                    &request.session_owner,
                    &request.session,
                    request.sip_entity_id,
                    request.aip_entity_id,
                );
                let state = match policy::can_schedule(request.id, request.request_type(), &scope, &live) {
                    Decision::Allow => RequestState::Created,
                    Decision::Block => RequestState::Blocked,
                };

                if requests::reset_for_retry(tx.conn(), &request, state).await? {
                    if let Some(job_id) = old_job {
                        jobs::set_locked(tx.conn(), job_id, false).await?;
                    }
                    debug!(request_id = %request.request_id, state = %state, "Request retried");
                    retried.push(request.request_id.clone());
                }
            }
            tx.commit().await?;
            Ok(retried)
        })
        .await?;

        if !retried.is_empty() {
            info!(count = retried.len(), "Retried requests");
            self.ctx.event_bus.emit_lossy(IngestEvent::RequestsRetried {
                request_ids: retried.clone(),
                timestamp: now(),
            });
        }
        Ok(retried)
    }

    /// Delete requests that are not RUNNING; returns the deleted request ids.
    ///
    /// RUNNING requests cannot be cancelled and are skipped. Deleting a
    /// request may release others, so an unblock pass follows.
    pub async fn delete(&self, ids: &[i64]) -> IngestResult<Vec<String>> {
        let db = &self.ctx.db;
        let deleted = retry_on_lock("delete_requests", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "delete_requests").await?;
            let mut deleted = Vec::new();
            let found = requests::find_by_ids(tx.conn(), ids).await?;
            for request in found {
                if request.state == RequestState::Running {
                    warn!(request_id = %request.request_id, "RUNNING request cannot be deleted");
                    continue;
                }
                if requests::delete_request(tx.conn(), request.id).await? {
                    deleted.push(request.request_id);
                }
            }
            tx.commit().await?;
            Ok(deleted)
        })
        .await?;

        if !deleted.is_empty() {
            info!(count = deleted.len(), "Deleted requests");
            self.unblock(None).await?;
        }
        Ok(deleted)
    }

    pub async fn find(&self, id: i64) -> IngestResult<Request> {
        let mut conn = self.ctx.db.acquire().await?;
        requests::find_request(&mut conn, id)
            .await?
            .ok_or_else(|| IngestError::NotFound(format!("Request {}", id)))
    }

    pub async fn find_by_ids(&self, ids: &[i64]) -> IngestResult<Vec<Request>> {
        let mut conn = self.ctx.db.acquire().await?;
        Ok(requests::find_by_ids(&mut conn, ids).await?)
    }

    pub async fn search(
        &self,
        filters: &RequestFilters,
        limit: i64,
        offset: i64,
    ) -> IngestResult<Vec<Request>> {
        let mut conn = self.ctx.db.acquire().await?;
        Ok(requests::search(&mut conn, filters, limit, offset).await?)
    }

    /// A job failed as a whole: its requests still RUNNING go to ERROR.
    ///
    /// Requests already waiting on storage are left to the storage results
    /// and the remote deadline sweep.
    pub async fn handle_job_error(&self, job: &JobInfo, error: &str) -> IngestResult<usize> {
        let mut failed = 0;
        for request in self.find_by_ids(&job.request_ids).await? {
            if request.state != RequestState::Running {
                continue;
            }
            if !request.group_ids.is_empty() {
                debug!(
                    request_id = %request.request_id,
                    job_id = job.id,
                    "Request awaits storage results, kept RUNNING"
                );
                continue;
            }
            let message = format!("Job {} failed: {}", job.id, error);
            if self.mark_error(&request, vec![message]).await? {
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Attach a remote group id to a RUNNING request
    pub async fn await_group(&self, request: &mut Request, group_id: &str) -> IngestResult<()> {
        let db = &self.ctx.db;
        let pending = &*request;
        retry_on_lock("await_group", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "await_group").await?;
            requests::update_details(tx.conn(), pending).await?;
            requests::add_group_id(tx.conn(), pending.id, group_id).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        request.group_ids.push(group_id.to_string());
        debug!(request_id = %request.request_id, group_id = %group_id, "Waiting for storage results");
        Ok(())
    }

    pub(crate) fn notify(
        &self,
        session_owner: &str,
        session: &str,
        step: SessionStep,
        request_type: RequestType,
        count: u32,
    ) {
        self.ctx.notifier.notify(SessionNotification::new(
            session_owner,
            session,
            step,
            request_type,
            count,
        ));
    }
}
