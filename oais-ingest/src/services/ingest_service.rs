//! Submission entry points
//!
//! SIP collections, AIP update campaigns, session deletions and manifest
//! saves all become requests through [`RequestService::register`]; this
//! service adds the submission-level checks (bulk size, shared metadata).

use std::collections::BTreeMap;

use oais_common::events::SessionStep;
use serde::Serialize;
use tracing::info;

use super::{Registration, RequestService};
use crate::error::{IngestError, IngestResult};
use crate::models::{
    AipUpdateTask, DeletionMode, IngestMetadata, RequestDraft, RequestType, SearchCriteria,
    SipDescriptor,
};
use crate::IngestContext;

/// Per-SIP result of a collection submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    /// Provider id → request id
    pub granted: BTreeMap<String, String>,
    /// Provider id → denial reason
    pub denied: BTreeMap<String, String>,
    pub messages: Vec<String>,
}

#[derive(Clone)]
pub struct IngestService {
    ctx: IngestContext,
    requests: RequestService,
}

impl IngestService {
    pub fn new(ctx: IngestContext) -> Self {
        let requests = RequestService::new(ctx.clone());
        Self { ctx, requests }
    }

    /// Register one ingest request per SIP of the collection.
    ///
    /// The whole collection is refused (`IngestError::Denied`) when it is
    /// too large, or when the shared metadata is invalid or names an
    /// unknown chain. Otherwise each SIP is granted or denied on its own.
    pub async fn handle_sip_collection(
        &self,
        metadata: IngestMetadata,
        sips: Vec<SipDescriptor>,
    ) -> IngestResult<RequestInfo> {
        let mut reasons = Vec::new();
        let max_bulk_size = self.ctx.config.ingest.max_bulk_size;
        if sips.len() > max_bulk_size {
            reasons.push(format!(
                "Too many SIPs in one submission: {} (max {})",
                sips.len(),
                max_bulk_size
            ));
        }
        reasons.extend(metadata.validate());
        if !metadata.chain.trim().is_empty() && !self.ctx.chains.contains(&metadata.chain) {
            reasons.push(format!("Unknown processing chain: {}", metadata.chain));
        }

        if !reasons.is_empty() {
            info!(
                session_owner = %metadata.session_owner,
                session = %metadata.session,
                sips = sips.len(),
                reasons = %reasons.join("; "),
                "SIP collection refused"
            );
            self.requests.notify(
                &metadata.session_owner,
                &metadata.session,
                SessionStep::Denied,
                RequestType::Ingest,
                u32::try_from(sips.len()).unwrap_or(u32::MAX),
            );
            return Err(IngestError::Denied(reasons));
        }

        let mut info = RequestInfo::default();
        for sip in sips {
            let provider_id = sip.provider_id.clone();
            match self.requests.register(RequestDraft::ingest(metadata.clone(), sip)).await? {
                Registration::Registered { request_id, .. } => {
                    info.granted.insert(provider_id, request_id);
                }
                Registration::Denied { reasons } => {
                    let reason = reasons.join("; ");
                    info.messages.push(format!("SIP {} denied: {}", provider_id, reason));
                    info.denied.insert(provider_id, reason);
                }
            }
        }

        info!(
            session_owner = %metadata.session_owner,
            session = %metadata.session,
            granted = info.granted.len(),
            denied = info.denied.len(),
            "SIP collection handled"
        );
        Ok(info)
    }

    /// Macro update over the AIPs matching `criteria`
    pub async fn schedule_aip_updates(
        &self,
        criteria: SearchCriteria,
        tasks: Vec<AipUpdateTask>,
    ) -> IngestResult<Registration> {
        self.requests
            .register(RequestDraft::updates_creator(criteria, tasks))
            .await
    }

    pub async fn schedule_session_deletion(
        &self,
        session_owner: &str,
        session: &str,
        deletion_mode: DeletionMode,
        delete_files: bool,
    ) -> IngestResult<Registration> {
        self.requests
            .register(RequestDraft::oais_deletion(
                session_owner,
                session,
                deletion_mode,
                delete_files,
            ))
            .await
    }

    pub async fn schedule_metadata_storage(
        &self,
        aip_entity_id: i64,
        remove_current: bool,
        compute_checksum: bool,
    ) -> IngestResult<Registration> {
        self.requests
            .register(RequestDraft::store_metadata(
                aip_entity_id,
                remove_current,
                compute_checksum,
            ))
            .await
    }
}
