//! AIP update runner
//!
//! The scheduler dispatches every pending update of an AIP in the same
//! unit, so all tasks of one AIP are applied together and saved once.
//! Removing a storage location deletes the AIP files stored there; the
//! update requests then wait for that deletion to be confirmed.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::await_remote;
use crate::clients::FileDeletionRequest;
use crate::db::{aips, requests as request_store};
use crate::error::IngestResult;
use crate::models::{AipEntity, AipState, Request, RequestDraft, RequestPayload};
use crate::services::RequestService;
use crate::IngestContext;

pub async fn run(ctx: &IngestContext, requests: &RequestService, batch: Vec<Request>) -> IngestResult<()> {
    let mut by_aip: BTreeMap<i64, Vec<Request>> = BTreeMap::new();
    for request in batch {
        match request.aip_entity_id {
            Some(aip_id) => by_aip.entry(aip_id).or_default().push(request),
            None => {
                requests
                    .mark_error(&request, vec!["AIP update without target AIP".to_string()])
                    .await?;
            }
        }
    }

    for (aip_id, mut updates) in by_aip {
        let Some(mut aip) = aips::find_aip(&ctx.db, aip_id).await? else {
            for request in &updates {
                requests
                    .mark_error(request, vec![format!("AIP {} not found", aip_id)])
                    .await?;
            }
            continue;
        };

        let original_storages: Vec<String> = aip.storages.iter().map(|s| s.storage.clone()).collect();
        let mut modified = false;
        let mut removed_storages: Vec<String> = Vec::new();
        for request in &updates {
            if let RequestPayload::AipUpdate(payload) = &request.payload {
                modified |= payload.task.apply(&mut aip);
                for storage in payload.task.removed_storages() {
                    if original_storages.contains(storage) && !removed_storages.contains(storage) {
                        removed_storages.push(storage.clone());
                    }
                }
            }
        }

        if modified {
            aips::update_aip(&ctx.db, &aip).await?;
        }
        debug!(aip_id = %aip.aip_id, updates = updates.len(), modified, "AIP updates applied");

        let deletions = file_deletions(&aip, &removed_storages);
        if deletions.is_empty() {
            for request in &updates {
                requests.mark_success(request).await?;
            }
            if modified {
                store_metadata_when_updated(ctx, requests, aip_id).await?;
            }
            continue;
        }

        match ctx.storage.delete(deletions).await {
            Ok(group_id) => {
                await_remote(ctx, requests, &mut updates, &group_id).await?;
                info!(
                    aip_id = %aip.aip_id,
                    storages = %removed_storages.join(","),
                    group_id = %group_id,
                    "Storage removal requested"
                );
            }
            Err(e) => {
                let errors = vec![format!("Storage removal failed: {}", e)];
                warn!(aip_id = %aip.aip_id, error = %e, "Storage removal request failed");
                aips::set_aip_state(&ctx.db, aip.id, AipState::Error, Some(errors.as_slice())).await?;
                for request in &updates {
                    requests.mark_error(request, errors.clone()).await?;
                }
            }
        }
    }
    Ok(())
}

/// Files of `aip` stored on the removed storage locations
fn file_deletions(aip: &AipEntity, removed_storages: &[String]) -> Vec<FileDeletionRequest> {
    let mut deletions = Vec::new();
    for storage in removed_storages {
        for file in &aip.files {
            deletions.push(FileDeletionRequest {
                owner: aip.aip_id.clone(),
                session_owner: aip.session_owner.clone(),
                session: aip.session.clone(),
                checksum: file.checksum.clone(),
                storage: storage.clone(),
            });
        }
    }
    deletions
}

/// Register a manifest save once no update of the AIP is RUNNING any more
pub async fn store_metadata_when_updated(
    ctx: &IngestContext,
    requests: &RequestService,
    aip_entity_id: i64,
) -> IngestResult<()> {
    let running = request_store::count_running_updates_for_aip(&ctx.db, aip_entity_id).await?;
    if running > 0 {
        return Ok(());
    }
    let registration = requests
        .register(RequestDraft::store_metadata(aip_entity_id, true, true))
        .await?;
    debug!(aip_entity_id, registration = ?registration, "Manifest save requested after update");
    Ok(())
}
