//! AIP manifest storage
//!
//! The manifest is the JSON description of the AIP, saved next to its data
//! files on every storage location as `<aip urn>.json`. The SHA-256 of the
//! manifest is recorded on the AIP once the storage service confirms it.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::await_remote;
use crate::clients::FileStorageRequest;
use crate::db::aips;
use crate::error::IngestResult;
use crate::models::{AipEntity, Request, RequestPayload};
use crate::services::RequestService;
use crate::IngestContext;

pub const MANIFEST_ALGORITHM: &str = "SHA-256";
pub const MANIFEST_MIME_TYPE: &str = "application/json";

fn manifest_bytes(aip: &AipEntity) -> IngestResult<Vec<u8>> {
    Ok(serde_json::to_vec(&aip.manifest())?)
}

/// SHA-256 (hex) of the AIP manifest
pub fn manifest_checksum(aip: &AipEntity) -> IngestResult<String> {
    Ok(format!("{:x}", Sha256::digest(manifest_bytes(aip)?)))
}

/// One manifest storage request per storage location of the AIP
pub fn manifest_requests(aip: &AipEntity) -> IngestResult<Vec<FileStorageRequest>> {
    let bytes = manifest_bytes(aip)?;
    let checksum = format!("{:x}", Sha256::digest(&bytes));
    let content = String::from_utf8_lossy(&bytes).into_owned();

    Ok(aip
        .storages
        .iter()
        .map(|storage| FileStorageRequest {
            owner: aip.aip_id.clone(),
            session_owner: aip.session_owner.clone(),
            session: aip.session.clone(),
            filename: format!("{}.json", aip.aip_id),
            checksum: checksum.clone(),
            algorithm: MANIFEST_ALGORITHM.to_string(),
            mime_type: MANIFEST_MIME_TYPE.to_string(),
            storage: storage.storage.clone(),
            store_path: storage.store_path.clone(),
            origin_url: None,
            content: Some(content.clone()),
        })
        .collect())
}

pub async fn run(ctx: &IngestContext, requests: &RequestService, batch: Vec<Request>) -> IngestResult<()> {
    for request in batch {
        let RequestPayload::AipStoreMetadata(payload) = &request.payload else {
            continue;
        };
        let aip = match request.aip_entity_id {
            Some(id) => aips::find_aip(&ctx.db, id).await?,
            None => None,
        };
        let Some(aip) = aip else {
            let target = request.aip_entity_id.map_or_else(|| "?".to_string(), |id| id.to_string());
            requests
                .mark_error(&request, vec![format!("AIP {} not found", target)])
                .await?;
            continue;
        };

        let files = manifest_requests(&aip)?;
        if files.is_empty() {
            if payload.compute_checksum {
                aips::set_manifest_checksum(&ctx.db, aip.id, &manifest_checksum(&aip)?).await?;
            }
            debug!(aip_id = %aip.aip_id, "AIP has no storage location, manifest kept locally");
            requests.mark_success(&request).await?;
            continue;
        }

        match ctx.storage.store(files).await {
            Ok(group_id) => {
                let mut waiting = [request];
                await_remote(ctx, requests, &mut waiting, &group_id).await?;
                info!(aip_id = %aip.aip_id, group_id = %group_id, "Manifest storage requested");
            }
            Err(e) => {
                requests
                    .mark_error(&request, vec![format!("Manifest storage failed: {}", e)])
                    .await?;
            }
        }
    }
    Ok(())
}
