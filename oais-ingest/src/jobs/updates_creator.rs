//! AIP updates creator: expands a macro update into one AIP update request
//! per matching AIP and task

use tracing::{debug, info};

use crate::db::aips;
use crate::error::IngestResult;
use crate::models::{Request, RequestDraft, RequestPayload};
use crate::services::{Registration, RequestService};
use crate::IngestContext;

pub async fn run(ctx: &IngestContext, requests: &RequestService, batch: Vec<Request>) -> IngestResult<()> {
    for request in batch {
        let RequestPayload::AipUpdatesCreator(payload) = &request.payload else {
            continue;
        };

        let matching = aips::search(&ctx.db, &payload.criteria).await?;
        let mut registered = 0usize;
        let mut denied = 0usize;
        for aip in &matching {
            for task in &payload.tasks {
                match requests.register(RequestDraft::aip_update(aip.id, task.clone())).await? {
                    Registration::Registered { .. } => registered += 1,
                    Registration::Denied { reasons } => {
                        debug!(aip_id = %aip.aip_id, reasons = %reasons.join("; "), "AIP update denied");
                        denied += 1;
                    }
                }
            }
        }

        info!(
            request_id = %request.request_id,
            aips = matching.len(),
            registered,
            denied,
            "AIP updates created"
        );
        requests.mark_success(&request).await?;
    }
    Ok(())
}
