//! Session-wide OAIS deletion
//!
//! Without file removal the SIPs and AIPs of the session are deleted right
//! away. With file removal each SIP gets a storage deletion request; those
//! stay BLOCKED behind this request and delete the entities once the
//! storage service confirms.

use tracing::{debug, info};

use crate::db::sips;
use crate::error::IngestResult;
use crate::models::{Request, RequestDraft, RequestPayload, SipState};
use crate::services::deletion::delete_sip_entities;
use crate::services::{Registration, RequestService};
use crate::IngestContext;

pub async fn run(ctx: &IngestContext, requests: &RequestService, batch: Vec<Request>) -> IngestResult<()> {
    for request in batch {
        let RequestPayload::OaisDeletion(payload) = &request.payload else {
            continue;
        };

        let session_sips: Vec<_> = sips::find_by_session(&ctx.db, &request.session_owner, &request.session)
            .await?
            .into_iter()
            .filter(|s| s.state != SipState::Deleted)
            .collect();

        if payload.delete_files {
            let mut registered = 0usize;
            for sip in &session_sips {
                let draft = RequestDraft::storage_deletion(sip.id, payload.deletion_mode);
                if let Registration::Denied { reasons } = requests.register(draft).await? {
                    debug!(sip_id = %sip.sip_id, reasons = %reasons.join("; "), "Storage deletion denied");
                } else {
                    registered += 1;
                }
            }
            info!(
                request_id = %request.request_id,
                session = %request.session,
                storage_deletions = registered,
                "Storage deletions registered"
            );
        } else {
            for sip in &session_sips {
                delete_sip_entities(ctx, sip.id, payload.deletion_mode).await?;
            }
            info!(
                request_id = %request.request_id,
                session = %request.session,
                sips = session_sips.len(),
                mode = ?payload.deletion_mode,
                "Session entities deleted"
            );
        }

        requests.mark_success(&request).await?;
    }
    Ok(())
}
