//! SIP/AIP entity deletion
//!
//! Shared by the OAIS deletion job (no remote files to remove) and the
//! storage deletion callback (remote files already removed).

use tracing::debug;

use crate::db::{aips, sips};
use crate::error::IngestResult;
use crate::models::{AipState, DeletionMode, SipState};
use crate::utils::{begin_monitored, retry_on_lock};
use crate::IngestContext;

/// Delete a SIP and its AIPs according to `mode`.
///
/// `BY_STATE` keeps the rows marked DELETED; `IRREVOCABLY` removes them
/// (AIP rows cascade with the SIP). Deleting an unknown SIP is a no-op.
pub async fn delete_sip_entities(
    ctx: &IngestContext,
    sip_entity_id: i64,
    mode: DeletionMode,
) -> IngestResult<()> {
    let db = &ctx.db;
    retry_on_lock("delete_sip_entities", ctx.max_lock_wait_ms(), || async move {
        let mut tx = begin_monitored(db, "delete_sip_entities").await?;
        match mode {
            DeletionMode::ByState => {
                aips::set_state_for_sip(tx.conn(), sip_entity_id, AipState::Deleted, None).await?;
                sips::set_sip_state(tx.conn(), sip_entity_id, SipState::Deleted, None).await?;
            }
            DeletionMode::Irrevocably => {
                aips::delete_for_sip(tx.conn(), sip_entity_id).await?;
                sips::delete_sip(tx.conn(), sip_entity_id).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    })
    .await?;

    debug!(sip_entity_id, mode = ?mode, "SIP entities deleted");
    Ok(())
}
