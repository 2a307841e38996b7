//! Database Test Utilities
//!
//! Temporary tenant databases, a wired [`IngestContext`] with recording
//! collaborators, and seed data.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use oais_common::events::EventBus;
use sqlx::SqlitePool;
use tempfile::TempDir;

use oais_ingest::chain::DEFAULT_CHAIN;
use oais_ingest::clients::memory::{RecordingNotifier, RecordingStorageClient};
use oais_ingest::clients::DbJobDispatcher;
use oais_ingest::config::IngestConfig;
use oais_ingest::db::{self, aips, requests::RequestFilters, sips};
use oais_ingest::models::{
    AipDraft, AipEntity, AipState, DataFile, IngestMetadata, Request, RequestType, SipDescriptor,
    SipEntity, SipState, StorageMetadata,
};
use oais_ingest::services::{Registration, RequestService};
use oais_ingest::IngestContext;

/// Create temporary tenant database with tables initialized
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("tenant.db");
    let pool = db::init_database_pool(&db_path).await?;
    Ok((temp_dir, pool))
}

/// Tenant context backed by a temporary database and the job table
/// dispatcher, with storage and notifications recorded in memory
pub struct TestHarness {
    _temp_dir: TempDir,
    pub ctx: IngestContext,
    pub storage: Arc<RecordingStorageClient>,
    pub notifier: Arc<RecordingNotifier>,
    pub event_bus: EventBus,
}

pub async fn create_harness() -> Result<TestHarness> {
    create_harness_with(IngestConfig::default()).await
}

pub async fn create_harness_with(config: IngestConfig) -> Result<TestHarness> {
    let (temp_dir, pool) = create_test_db().await?;
    let storage = Arc::new(RecordingStorageClient::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let event_bus = EventBus::new(1000);
    let dispatcher = DbJobDispatcher::new(pool.clone(), config.ingest.max_lock_wait_ms);

    let ctx = IngestContext::new(
        "test",
        pool,
        event_bus.clone(),
        Arc::new(config),
        storage.clone(),
        notifier.clone(),
        Arc::new(dispatcher),
    );

    Ok(TestHarness {
        _temp_dir: temp_dir,
        ctx,
        storage,
        notifier,
        event_bus,
    })
}

pub fn data_file(checksum: &str) -> DataFile {
    DataFile {
        filename: format!("{}.dat", checksum),
        checksum: checksum.to_string(),
        algorithm: "MD5".to_string(),
        mime_type: "application/octet-stream".to_string(),
        origin_url: None,
    }
}

/// Default chain, one `disk` storage
pub fn ingest_metadata(session: &str) -> IngestMetadata {
    IngestMetadata::new("owner", session, DEFAULT_CHAIN).with_storage(StorageMetadata::new("disk"))
}

/// A STORED SIP with one STORED AIP holding one file on `disk`
pub async fn seed_stored_aip(
    pool: &SqlitePool,
    session: &str,
    provider_id: &str,
) -> Result<(SipEntity, AipEntity)> {
    let descriptor = SipDescriptor::new(provider_id).with_file(data_file(&format!("{}-file", provider_id)));
    let mut sip = SipEntity::new(descriptor.clone(), "owner", session, 1, descriptor.checksum()?);
    sip.state = SipState::Stored;
    sip.id = sips::insert_sip(pool, &sip).await?;

    let draft = AipDraft {
        provider_id: provider_id.to_string(),
        tags: vec!["seed".to_string()],
        categories: Vec::new(),
        storages: vec![StorageMetadata::new("disk")],
        files: descriptor.files.clone(),
    };
    let mut aip = AipEntity::from_draft(draft, sip.id, sip.version, "owner", session);
    aip.state = AipState::Stored;
    aip.id = aips::insert_aip(pool, &aip).await?;

    Ok((sip, aip))
}

/// Database id of a registered request; panics on denial
pub fn registered_id(registration: &Registration) -> i64 {
    match registration {
        Registration::Registered { id, .. } => *id,
        Registration::Denied { reasons } => panic!("Request denied: {:?}", reasons),
    }
}

pub async fn requests_of_type(ctx: &IngestContext, request_type: RequestType) -> Result<Vec<Request>> {
    let filters = RequestFilters {
        request_type: Some(request_type),
        ..Default::default()
    };
    Ok(RequestService::new(ctx.clone()).search(&filters, 1000, 0).await?)
}

/// Age the heartbeat of every RUNNING job past any lease
pub async fn expire_job_leases(pool: &SqlitePool) -> Result<u64> {
    let stale = oais_common::time::now() - chrono::Duration::days(1);
    let result = sqlx::query("UPDATE jobs SET heartbeat = ? WHERE status = 'RUNNING'")
        .bind(oais_common::time::to_db(&stale))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
