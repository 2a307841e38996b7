//! SIP ingestion integration tests
//!
//! Submission, chain processing, storage results and remote deadlines,
//! driven through the scheduler, the job worker and the reconciler.

mod helpers;

use helpers::{create_harness, create_harness_with, data_file, ingest_metadata, requests_of_type};
use oais_common::events::{IngestEvent, SessionStep};
use oais_ingest::clients::{RemoteOutcome, RemoteResult, RemoteStatus};
use oais_ingest::config::IngestConfig;
use oais_ingest::db::{aips, sips};
use oais_ingest::models::{AipState, DeletionMode, RequestState, RequestType, SipDescriptor, SipState};
use oais_ingest::services::reconciler::REMOTE_TIMEOUT_MESSAGE;
use oais_ingest::services::{IngestService, Reconciler, RequestService, Scheduler, Worker};
use oais_ingest::IngestError;

fn sip(provider_id: &str) -> SipDescriptor {
    SipDescriptor::new(provider_id).with_file(data_file(&format!("{}-a", provider_id)))
}

/// Schedule every CREATED ingest request and run the resulting jobs
async fn process_ingests(h: &helpers::TestHarness) {
    Scheduler::new(h.ctx.clone())
        .schedule(RequestType::Ingest)
        .await
        .unwrap();
    Worker::new(h.ctx.clone()).drain().await.unwrap();
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn test_collection_grants_valid_and_denies_invalid_sips() {
    let h = create_harness().await.unwrap();
    let service = IngestService::new(h.ctx.clone());

    let mut bad = sip("P2");
    bad.files[0].algorithm = "CRC32".to_string();

    let info = service
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1"), bad])
        .await
        .unwrap();

    assert_eq!(info.granted.len(), 1);
    assert!(info.granted.contains_key("P1"));
    assert!(info.denied["P2"].contains("unsupported checksum algorithm CRC32"));
    assert_eq!(info.messages.len(), 1);
    assert_eq!(requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().len(), 1);
    assert_eq!(h.notifier.total(SessionStep::Granted), 1);
    assert_eq!(h.notifier.total(SessionStep::Denied), 1);
}

#[tokio::test]
async fn test_collection_over_bulk_limit_is_refused() {
    let mut config = IngestConfig::default();
    config.ingest.max_bulk_size = 2;
    let h = create_harness_with(config).await.unwrap();

    let result = IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1"), sip("P2"), sip("P3")])
        .await;

    match result {
        Err(IngestError::Denied(reasons)) => assert!(reasons[0].contains("Too many SIPs")),
        other => panic!("Expected refusal, got {:?}", other),
    }
    assert!(requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().is_empty());
    assert_eq!(h.notifier.total(SessionStep::Denied), 3);
}

#[tokio::test]
async fn test_collection_with_unknown_chain_is_refused() {
    let h = create_harness().await.unwrap();
    let mut metadata = ingest_metadata("s1");
    metadata.chain = "NoSuchChain".to_string();

    let result = IngestService::new(h.ctx.clone())
        .handle_sip_collection(metadata, vec![sip("P1")])
        .await;

    assert!(matches!(result, Err(IngestError::Denied(ref r)) if r[0].contains("NoSuchChain")));
}

// ============================================================================
// Chain processing and storage results
// ============================================================================

/// Given two valid SIPs submitted together
/// When they are scheduled, processed and storage confirms every file
/// Then both SIPs and their AIPs are STORED and the requests are gone
#[tokio::test]
async fn test_sips_are_ingested_and_stored() {
    let h = create_harness().await.unwrap();
    let info = IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1"), sip("P2")])
        .await
        .unwrap();
    assert_eq!(info.granted.len(), 2);

    let report = Scheduler::new(h.ctx.clone())
        .schedule(RequestType::Ingest)
        .await
        .unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.jobs.len(), 1, "one chain, one job");
    Worker::new(h.ctx.clone()).drain().await.unwrap();

    let stored = h.storage.stored();
    assert_eq!(stored.len(), 2);
    for (_, files) in &stored {
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].storage, "disk");
    }
    for request in requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap() {
        assert_eq!(request.state, RequestState::Running);
        assert_eq!(request.group_ids.len(), 1);
        assert!(request.remote_step_deadline.is_some());
    }

    for (group_id, _) in &stored {
        h.storage.complete(RemoteOutcome::new(group_id.clone(), RemoteStatus::Success));
    }
    assert_eq!(Reconciler::new(h.ctx.clone()).poll_pending().await.unwrap(), 2);

    assert!(requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().is_empty());
    let entities = sips::find_by_session(&h.ctx.db, "owner", "s1").await.unwrap();
    assert_eq!(entities.len(), 2);
    for sip in entities {
        assert_eq!(sip.state, SipState::Stored);
        let aips = aips::find_by_sip(&h.ctx.db, sip.id).await.unwrap();
        assert_eq!(aips.len(), 1);
        assert_eq!(aips[0].state, AipState::Stored);
    }
    assert_eq!(h.notifier.total(SessionStep::Success), 2);
}

/// Given a batch where one SIP lists the same data file twice
/// When the batch is processed
/// Then only that SIP fails validation, the other goes on to storage
/// And one aggregated failure event names the failed SIP
#[tokio::test]
async fn test_failing_sip_does_not_stop_batch() {
    let h = create_harness().await.unwrap();
    let mut events = h.event_bus.subscribe();

    let duplicated = SipDescriptor::new("P2")
        .with_file(data_file("dup"))
        .with_file(data_file("dup"));
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1"), duplicated])
        .await
        .unwrap();
    process_ingests(&h).await;

    assert_eq!(h.storage.stored().len(), 1);
    let requests = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap();
    let failed = requests
        .iter()
        .find(|r| r.provider_id.as_deref() == Some("P2"))
        .unwrap();
    assert_eq!(failed.state, RequestState::Error);
    assert!(failed.errors[0].starts_with("validation: Duplicate data file checksum dup"));
    let running = requests
        .iter()
        .find(|r| r.provider_id.as_deref() == Some("P1"))
        .unwrap();
    assert_eq!(running.state, RequestState::Running);

    let failed_sip = sips::find_sip(&h.ctx.db, failed.sip_entity_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed_sip.state, SipState::Error);
    assert_eq!(failed_sip.errors, failed.errors);

    let mut chain_failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let IngestEvent::ChainBatchFailed { failures, .. } = event {
            chain_failures.extend(failures);
        }
    }
    assert_eq!(chain_failures.len(), 1);
    assert_eq!(chain_failures[0].provider_id, "P2");
}

#[tokio::test]
async fn test_same_sip_cannot_be_ingested_twice() {
    let h = create_harness().await.unwrap();
    let service = IngestService::new(h.ctx.clone());

    service
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(&h).await;
    let (group_id, _) = h.storage.stored().remove(0);
    h.storage.complete(RemoteOutcome::new(group_id, RemoteStatus::Success));
    Reconciler::new(h.ctx.clone()).poll_pending().await.unwrap();

    service
        .handle_sip_collection(ingest_metadata("s2"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(&h).await;

    let requests = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].state, RequestState::Error);
    assert!(requests[0].errors[0].starts_with("init: SIP P1 already ingested"));
    assert_eq!(h.storage.stored().len(), 1);
}

/// Given an ingest request waiting on storage
/// When the same success result is delivered twice
/// Then the second delivery changes nothing
#[tokio::test]
async fn test_duplicate_storage_result_is_ignored() {
    let h = create_harness().await.unwrap();
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(&h).await;
    let (group_id, _) = h.storage.stored().remove(0);

    let reconciler = Reconciler::new(h.ctx.clone());
    let outcome = RemoteOutcome::new(group_id, RemoteStatus::Success);
    let first = reconciler.handle_storage_results(&outcome).await.unwrap();
    assert_eq!(first.succeeded.len(), 1);

    let second = reconciler.handle_storage_results(&outcome).await.unwrap();
    assert!(second.succeeded.is_empty());
    assert!(second.failed.is_empty());
    assert_eq!(h.notifier.total(SessionStep::Success), 1);
}

/// Ingest a SIP up to the storage wait, then delete its session by state
async fn ingest_then_delete_session(h: &helpers::TestHarness) -> String {
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(h).await;
    let (group_id, _) = h.storage.stored().remove(0);

    IngestService::new(h.ctx.clone())
        .schedule_session_deletion("owner", "s1", DeletionMode::ByState, false)
        .await
        .unwrap();
    let report = Scheduler::new(h.ctx.clone())
        .schedule(RequestType::OaisDeletion)
        .await
        .unwrap();
    assert_eq!(report.claimed, 1);
    Worker::new(h.ctx.clone()).drain().await.unwrap();

    let entities = sips::find_by_session(&h.ctx.db, "owner", "s1").await.unwrap();
    assert_eq!(entities[0].state, SipState::Deleted);
    group_id
}

async fn assert_session_stays_deleted(h: &helpers::TestHarness) {
    let entities = sips::find_by_session(&h.ctx.db, "owner", "s1").await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].state, SipState::Deleted);
    for aip in aips::find_by_sip(&h.ctx.db, entities[0].id).await.unwrap() {
        assert_eq!(aip.state, AipState::Deleted);
    }
}

/// Given an ingest waiting on storage whose session was deleted by state
/// When storage confirms the files afterwards
/// Then the SIP and AIP stay DELETED and the ingest request completes
#[tokio::test]
async fn test_late_storage_success_keeps_deleted_entities() {
    let h = create_harness().await.unwrap();
    let group_id = ingest_then_delete_session(&h).await;

    h.storage.complete(RemoteOutcome::new(group_id, RemoteStatus::Success));
    assert_eq!(Reconciler::new(h.ctx.clone()).poll_pending().await.unwrap(), 1);

    assert_session_stays_deleted(&h).await;
    assert!(requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_late_storage_error_keeps_deleted_entities() {
    let h = create_harness().await.unwrap();
    let group_id = ingest_then_delete_session(&h).await;

    h.storage.complete(RemoteOutcome::new(group_id, RemoteStatus::Error));
    Reconciler::new(h.ctx.clone()).poll_pending().await.unwrap();

    assert_session_stays_deleted(&h).await;
    let requests = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap();
    assert_eq!(requests[0].state, RequestState::Error);
}

#[tokio::test]
async fn test_granted_result_keeps_request_waiting() {
    let h = create_harness().await.unwrap();
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(&h).await;
    let (group_id, _) = h.storage.stored().remove(0);

    let report = Reconciler::new(h.ctx.clone())
        .handle_storage_results(&RemoteOutcome::new(group_id, RemoteStatus::Granted))
        .await
        .unwrap();

    assert_eq!(report.waiting, 1);
    let requests = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap();
    assert_eq!(requests[0].state, RequestState::Running);
}

/// Given an ingest request waiting on storage
/// When storage reports a file failure
/// Then SIP, AIP and request go to ERROR with the translated cause
/// And a retry processes the same SIP again up to STORED
#[tokio::test]
async fn test_storage_error_then_retry() {
    let h = create_harness().await.unwrap();
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(&h).await;
    let (group_id, files) = h.storage.stored().remove(0);

    let outcome = RemoteOutcome::new(group_id, RemoteStatus::Error).with_result(RemoteResult {
        owner: files[0].owner.clone(),
        checksum: files[0].checksum.clone(),
        storage: "disk".to_string(),
        message: Some("disk full".to_string()),
    });
    let report = Reconciler::new(h.ctx.clone())
        .handle_storage_results(&outcome)
        .await
        .unwrap();
    assert_eq!(report.failed.len(), 1);

    let request = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().remove(0);
    assert_eq!(request.state, RequestState::Error);
    assert!(request.errors[0].contains("disk full"));
    let sip_id = request.sip_entity_id.unwrap();
    let sip = sips::find_sip(&h.ctx.db, sip_id).await.unwrap().unwrap();
    assert_eq!(sip.state, SipState::Error);
    let aips = aips::find_by_sip(&h.ctx.db, sip_id).await.unwrap();
    assert_eq!(aips[0].state, AipState::Error);
    assert!(aips[0].errors[0].contains("disk full"));

    let service = RequestService::new(h.ctx.clone());
    assert_eq!(service.retry(&[request.id]).await.unwrap().len(), 1);
    process_ingests(&h).await;

    let stored = h.storage.stored();
    assert_eq!(stored.len(), 2);
    h.storage.complete(RemoteOutcome::new(stored[1].0.clone(), RemoteStatus::Success));
    Reconciler::new(h.ctx.clone()).poll_pending().await.unwrap();

    let sip = sips::find_sip(&h.ctx.db, sip_id).await.unwrap().unwrap();
    assert_eq!(sip.state, SipState::Stored);
    assert_eq!(sip.version, 1, "retry reuses the SIP of the first attempt");
    assert_eq!(aips::find_by_sip(&h.ctx.db, sip_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_expired_remote_step_fails_request() {
    let mut config = IngestConfig::default();
    config.ingest.remote_request_timeout_minutes = 0;
    let h = create_harness_with(config).await.unwrap();

    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(&h).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let reconciler = Reconciler::new(h.ctx.clone());
    let expired = reconciler.expire_deadlines().await.unwrap();
    assert_eq!(expired.len(), 1);

    let request = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().remove(0);
    assert_eq!(request.state, RequestState::Error);
    assert_eq!(request.errors, vec![REMOTE_TIMEOUT_MESSAGE.to_string()]);
    assert!(reconciler.expire_deadlines().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_storage_refusal_fails_sip_at_remote_step() {
    let h = create_harness().await.unwrap();
    h.storage.fail_with(Some("storage offline"));

    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), vec![sip("P1")])
        .await
        .unwrap();
    process_ingests(&h).await;

    let request = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().remove(0);
    assert_eq!(request.state, RequestState::Error);
    assert!(request.errors[0].starts_with("remote storage: "));
    assert!(request.errors[0].contains("storage offline"));
}

// ============================================================================
// Concurrent scheduling
// ============================================================================

/// Given a page of CREATED ingest requests
/// When two schedulers scan concurrently
/// Then every request is claimed exactly once
#[tokio::test]
async fn test_concurrent_schedulers_never_double_dispatch() {
    let h = create_harness().await.unwrap();
    let sips: Vec<SipDescriptor> = (0..10).map(|i| sip(&format!("P{}", i))).collect();
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(ingest_metadata("s1"), sips)
        .await
        .unwrap();

    let a = Scheduler::new(h.ctx.clone());
    let b = Scheduler::new(h.ctx.clone());
    let (ra, rb) = tokio::join!(a.schedule(RequestType::Ingest), b.schedule(RequestType::Ingest));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.claimed + rb.claimed, 10);
    let requests = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap();
    assert!(requests.iter().all(|r| r.state == RequestState::Running && r.job_id.is_some()));

    let jobs: Vec<i64> = ra.jobs.iter().chain(rb.jobs.iter()).copied().collect();
    for request in &requests {
        assert!(jobs.contains(&request.job_id.unwrap()));
    }
}
