//! Removal of one SIP's stored files; entities are deleted on confirmation

use tracing::{info, warn};

use super::await_remote;
use crate::clients::FileDeletionRequest;
use crate::db::aips;
use crate::error::IngestResult;
use crate::models::{AipEntity, Request, RequestPayload};
use crate::services::deletion::delete_sip_entities;
use crate::services::RequestService;
use crate::IngestContext;

/// Every file of every AIP on every storage location
pub fn stored_files(aips: &[AipEntity]) -> Vec<FileDeletionRequest> {
    let mut files = Vec::new();
    for aip in aips {
        for storage in &aip.storages {
            for file in &aip.files {
                files.push(FileDeletionRequest {
                    owner: aip.aip_id.clone(),
                    session_owner: aip.session_owner.clone(),
                    session: aip.session.clone(),
                    checksum: file.checksum.clone(),
                    storage: storage.storage.clone(),
                });
            }
        }
    }
    files
}

pub async fn run(ctx: &IngestContext, requests: &RequestService, batch: Vec<Request>) -> IngestResult<()> {
    for request in batch {
        let RequestPayload::StorageDeletion(payload) = &request.payload else {
            continue;
        };
        let Some(sip_id) = request.sip_entity_id else {
            requests
                .mark_error(&request, vec!["Storage deletion without target SIP".to_string()])
                .await?;
            continue;
        };

        let files = stored_files(&aips::find_by_sip(&ctx.db, sip_id).await?);
        if files.is_empty() {
            delete_sip_entities(ctx, sip_id, payload.deletion_mode).await?;
            requests.mark_success(&request).await?;
            continue;
        }

        let count = files.len();
        match ctx.storage.delete(files).await {
            Ok(group_id) => {
                let mut waiting = [request];
                await_remote(ctx, requests, &mut waiting, &group_id).await?;
                info!(sip_entity_id = sip_id, files = count, group_id = %group_id, "File deletion requested");
            }
            Err(e) => {
                warn!(sip_entity_id = sip_id, error = %e, "File deletion request failed");
                requests
                    .mark_error(&request, vec![format!("File deletion failed: {}", e)])
                    .await?;
            }
        }
    }
    Ok(())
}
