//! Per-SIP chain execution
//!
//! Runs a batch of ingest requests through one chain. A failing step ends
//! processing for its SIP only: the SIP (and its AIPs, if any) go to ERROR
//! with `"<step>: <reason>"` messages, the request goes to ERROR, and the
//! runner moves on. One aggregated event reports every failure of the batch.

use std::sync::Arc;

use oais_common::events::{ChainFailure, IngestEvent};
use oais_common::time::now;
use tracing::{debug, info, warn};

use super::ProcessingChain;
use crate::clients::FileStorageRequest;
use crate::db::{aips, requests, sips};
use crate::error::IngestResult;
use crate::jobs::remote_deadline;
use crate::models::{
    AipEntity, AipState, IngestMetadata, IngestStep, Request, RequestState, SipEntity, SipState,
};
use crate::services::RequestService;
use crate::utils::{begin_monitored, retry_on_lock};
use crate::IngestContext;

/// Per-batch outcome
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainBatchReport {
    /// Requests that reached remote storage (or were stored outright)
    pub succeeded: Vec<String>,
    pub failures: Vec<ChainFailure>,
}

/// A step refused the SIP
struct StepError {
    step: IngestStep,
    reasons: Vec<String>,
}

impl StepError {
    fn new(step: IngestStep, reasons: Vec<String>) -> Self {
        Self { step, reasons }
    }

    fn messages(&self) -> Vec<String> {
        self.reasons
            .iter()
            .map(|r| format!("{}: {}", self.step.label(), r))
            .collect()
    }
}

/// Outer error: infrastructure failure (fails the job);
/// inner error: the SIP was refused.
type StepOutcome = IngestResult<Result<(), StepError>>;

pub struct ChainRunner {
    ctx: IngestContext,
    requests: RequestService,
}

impl ChainRunner {
    pub fn new(ctx: IngestContext) -> Self {
        let requests = RequestService::new(ctx.clone());
        Self { ctx, requests }
    }

    /// Process a batch of RUNNING ingest requests with the named chain
    pub async fn run(
        &self,
        chain_name: &str,
        job_id: Option<i64>,
        batch: Vec<Request>,
    ) -> IngestResult<ChainBatchReport> {
        let mut report = ChainBatchReport::default();
        let chain = self.ctx.chains.get(chain_name);

        info!(chain = %chain_name, sips = batch.len(), "Processing chain batch");

        for mut request in batch {
            if request.state != RequestState::Running || request.ingest_payload().is_none() {
                debug!(request_id = %request.request_id, "Skipping request not RUNNING ingest");
                continue;
            }

            let outcome = match &chain {
                Some(chain) => self.process(chain, &mut request).await?,
                None => Err(StepError::new(
                    IngestStep::LocalInit,
                    vec![format!("Unknown processing chain: {}", chain_name)],
                )),
            };

            match outcome {
                Ok(()) => report.succeeded.push(request.request_id.clone()),
                Err(step_error) => {
                    let errors = step_error.messages();
                    self.fail(&mut request, step_error.step, &errors).await?;
                    report.failures.push(ChainFailure {
                        request_id: request.request_id.clone(),
                        provider_id: request.provider_id.clone().unwrap_or_default(),
                        errors,
                    });
                }
            }
        }

        if !report.failures.is_empty() {
            warn!(
                chain = %chain_name,
                failed = report.failures.len(),
                succeeded = report.succeeded.len(),
                "Chain batch finished with failures"
            );
            self.ctx.event_bus.emit_lossy(IngestEvent::ChainBatchFailed {
                chain: chain_name.to_string(),
                job_id,
                failures: report.failures.clone(),
                timestamp: now(),
            });
        } else {
            info!(chain = %chain_name, succeeded = report.succeeded.len(), "Chain batch finished");
        }

        Ok(report)
    }

    async fn process(&self, chain: &Arc<ProcessingChain>, request: &mut Request) -> StepOutcome {
        let Some(payload) = request.ingest_payload().cloned() else {
            return Ok(Ok(()));
        };
        let metadata = payload.metadata;
        let mut descriptor = payload.sip;

        // Init
        request.set_ingest_step(IngestStep::LocalInit, None);
        let mut sip = match self.init_sip(request, &metadata).await? {
            Ok(sip) => sip,
            Err(reason) => return Ok(Err(StepError::new(IngestStep::LocalInit, vec![reason]))),
        };
        request.sip_entity_id = Some(sip.id);
        self.save_progress(request).await?;

        if let Some(step) = &chain.preprocessing {
            request.set_ingest_step(IngestStep::LocalPreProcessing, None);
            descriptor = match step.preprocess(descriptor).await {
                Ok(descriptor) => descriptor,
                Err(f) => return Ok(Err(StepError::new(IngestStep::LocalPreProcessing, f.reasons))),
            };
        }

        request.set_ingest_step(IngestStep::LocalValidation, None);
        if let Err(f) = chain.validation.validate(&descriptor).await {
            return Ok(Err(StepError::new(IngestStep::LocalValidation, f.reasons)));
        }

        request.set_ingest_step(IngestStep::LocalGeneration, None);
        let mut drafts = match chain.generation.generate(&descriptor, &metadata).await {
            Ok(drafts) if drafts.is_empty() => {
                return Ok(Err(StepError::new(
                    IngestStep::LocalGeneration,
                    vec!["no AIP generated".to_string()],
                )))
            }
            Ok(drafts) => drafts,
            Err(f) => return Ok(Err(StepError::new(IngestStep::LocalGeneration, f.reasons))),
        };

        if let Some(step) = &chain.tagging {
            request.set_ingest_step(IngestStep::LocalTagging, None);
            drafts = match step.tag(drafts).await {
                Ok(drafts) => drafts,
                Err(f) => return Ok(Err(StepError::new(IngestStep::LocalTagging, f.reasons))),
            };
        }

        if let Some(step) = &chain.postprocessing {
            request.set_ingest_step(IngestStep::LocalPostProcessing, None);
            if let Err(f) = step.postprocess(&descriptor, &drafts).await {
                return Ok(Err(StepError::new(IngestStep::LocalPostProcessing, f.reasons)));
            }
        }

        // Final: persist SIP and AIPs
        request.set_ingest_step(IngestStep::LocalFinal, None);
        sip.sip = descriptor;
        sip.state = SipState::Ingested;
        let aips: Vec<AipEntity> = drafts
            .into_iter()
            .map(|d| AipEntity::from_draft(d, sip.id, sip.version, &sip.session_owner, &sip.session))
            .collect();
        let aips = self.save_generated(&sip, aips).await?;

        let files = storage_requests(&aips);
        if files.is_empty() {
            self.mark_stored(sip.id).await?;
            self.requests.mark_success(request).await?;
            info!(request_id = %request.request_id, sip_id = %sip.sip_id, "SIP stored (no data files)");
            return Ok(Ok(()));
        }

        let deadline = remote_deadline(&self.ctx)?;
        match self.ctx.storage.store(files).await {
            Ok(group_id) => {
                request.set_ingest_step(IngestStep::RemoteStorageRequested, Some(deadline));
                self.requests.await_group(request, &group_id).await?;
                info!(
                    request_id = %request.request_id,
                    sip_id = %sip.sip_id,
                    aips = aips.len(),
                    group_id = %group_id,
                    "SIP ingested, storage requested"
                );
                Ok(Ok(()))
            }
            Err(e) => Ok(Err(StepError::new(
                IngestStep::RemoteStorageRequested,
                vec![e.to_string()],
            ))),
        }
    }

    /// Saved SIP for the request: a new version, or the one a previous
    /// attempt left behind. `Err` is the refusal reason.
    async fn init_sip(
        &self,
        request: &Request,
        metadata: &IngestMetadata,
    ) -> IngestResult<Result<SipEntity, String>> {
        let Some(payload) = request.ingest_payload() else {
            return Ok(Err("not an ingest request".to_string()));
        };
        let checksum = payload.sip.checksum()?;
        let db = &self.ctx.db;

        if let Some(sip_id) = request.sip_entity_id {
            if let Some(mut sip) = sips::find_sip(db, sip_id).await? {
                if matches!(sip.state, SipState::Stored | SipState::Deleted) {
                    return Ok(Err(format!("SIP {} is already {}", sip.sip_id, sip.state.as_str())));
                }
                let sip_ref = &sip;
                retry_on_lock("reset_sip", self.ctx.max_lock_wait_ms(), || async move {
                    let mut tx = begin_monitored(db, "reset_sip").await?;
                    aips::delete_for_sip(tx.conn(), sip_ref.id).await?;
                    sips::set_sip_state(tx.conn(), sip_ref.id, SipState::Created, Some(&[] as &[String])).await?;
                    tx.commit().await?;
                    Ok(())
                })
                .await?;
                sip.state = SipState::Created;
                sip.errors.clear();
                debug!(sip_id = %sip.sip_id, "Reprocessing SIP from a previous attempt");
                return Ok(Ok(sip));
            }
        }

        if sips::is_checksum_ingested(db, &checksum).await? {
            return Ok(Err(format!(
                "SIP {} already ingested (checksum {})",
                payload.sip.provider_id, checksum
            )));
        }

        let descriptor = &payload.sip;
        let checksum = &checksum;
        let sip = retry_on_lock("create_sip", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "create_sip").await?;
            let version = sips::next_version(tx.conn(), &descriptor.provider_id).await?;
            let mut sip = SipEntity::new(
                descriptor.clone(),
                &metadata.session_owner,
                &metadata.session,
                version,
                checksum.clone(),
            );
            sip.id = sips::insert_sip(tx.conn(), &sip).await?;
            tx.commit().await?;
            Ok(sip)
        })
        .await?;

        debug!(sip_id = %sip.sip_id, version = sip.version, "SIP created");
        Ok(Ok(sip))
    }

    async fn save_progress(&self, request: &Request) -> IngestResult<()> {
        requests::update_details(&self.ctx.db, request).await?;
        Ok(())
    }

    async fn save_generated(
        &self,
        sip: &SipEntity,
        aips: Vec<AipEntity>,
    ) -> IngestResult<Vec<AipEntity>> {
        let db = &self.ctx.db;
        let pending = &aips;
        let ids = retry_on_lock("save_generated", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "save_generated").await?;
            sips::update_sip(tx.conn(), sip).await?;
            let mut ids = Vec::with_capacity(pending.len());
            for aip in pending {
                ids.push(aips::insert_aip(tx.conn(), aip).await?);
            }
            tx.commit().await?;
            Ok(ids)
        })
        .await?;

        Ok(aips
            .into_iter()
            .zip(ids)
            .map(|(mut aip, id)| {
                aip.id = id;
                aip
            })
            .collect())
    }

    async fn mark_stored(&self, sip_entity_id: i64) -> IngestResult<()> {
        let db = &self.ctx.db;
        retry_on_lock("mark_stored", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "mark_stored").await?;
            aips::set_state_for_sip(tx.conn(), sip_entity_id, AipState::Stored, None).await?;
            sips::set_sip_state(tx.conn(), sip_entity_id, SipState::Stored, None).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record a refused SIP: entity errors, failing step, request ERROR
    async fn fail(&self, request: &mut Request, step: IngestStep, errors: &[String]) -> IngestResult<()> {
        request.set_ingest_step(step, None);
        let db = &self.ctx.db;
        let pending = &*request;
        retry_on_lock("chain_failure", self.ctx.max_lock_wait_ms(), || async move {
            let mut tx = begin_monitored(db, "chain_failure").await?;
            requests::update_details(tx.conn(), pending).await?;
            if let Some(sip_id) = pending.sip_entity_id {
                sips::set_sip_state(tx.conn(), sip_id, SipState::Error, Some(errors)).await?;
                aips::set_state_for_sip(tx.conn(), sip_id, AipState::Error, Some(errors)).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await?;

        self.requests.mark_error(request, errors.to_vec()).await?;
        Ok(())
    }
}

/// One storage request per AIP, storage target and data file
pub fn storage_requests(aips: &[AipEntity]) -> Vec<FileStorageRequest> {
    let mut files = Vec::new();
    for aip in aips {
        for storage in &aip.storages {
            for file in &aip.files {
                files.push(FileStorageRequest {
                    owner: aip.aip_id.clone(),
                    session_owner: aip.session_owner.clone(),
                    session: aip.session.clone(),
                    filename: file.filename.clone(),
                    checksum: file.checksum.clone(),
                    algorithm: file.algorithm.clone(),
                    mime_type: file.mime_type.clone(),
                    storage: storage.storage.clone(),
                    store_path: storage.store_path.clone(),
                    origin_url: file.origin_url.clone(),
                    content: None,
                });
            }
        }
    }
    files
}
