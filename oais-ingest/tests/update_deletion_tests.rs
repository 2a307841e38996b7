//! AIP update, manifest and deletion workflow tests
//!
//! Also covers worker recovery of jobs interrupted by a restart.

mod helpers;

use helpers::{
    create_harness, data_file, expire_job_leases, registered_id, requests_of_type, seed_stored_aip,
};
use oais_ingest::clients::{RemoteOutcome, RemoteStatus};
use oais_ingest::db::{aips, jobs, sips};
use oais_ingest::models::{
    AipState, AipUpdateTask, DeletionMode, JobStatus, RequestDraft, RequestState, RequestType,
    SearchCriteria, SipDescriptor, SipState,
};
use oais_ingest::jobs::JobExecutor;
use oais_ingest::services::{IngestService, Reconciler, RequestService, Scheduler, Worker};

fn criteria(session: &str) -> SearchCriteria {
    SearchCriteria {
        session_owner: "owner".to_string(),
        session: session.to_string(),
        provider_ids: Vec::new(),
        state: None,
    }
}

/// Schedule one request type and run the resulting jobs
async fn run_type(h: &helpers::TestHarness, request_type: RequestType) -> usize {
    let report = Scheduler::new(h.ctx.clone())
        .schedule(request_type)
        .await
        .unwrap();
    Worker::new(h.ctx.clone()).drain().await.unwrap();
    report.claimed
}

/// Confirm every storage call recorded so far
async fn confirm_all(h: &helpers::TestHarness) {
    let stored = h.storage.stored().into_iter().map(|(group_id, _)| group_id);
    let deleted = h.storage.deleted().into_iter().map(|(group_id, _)| group_id);
    for group_id in stored.chain(deleted) {
        h.storage.complete(RemoteOutcome::new(group_id, RemoteStatus::Success));
    }
    Reconciler::new(h.ctx.clone()).poll_pending().await.unwrap();
}

// ============================================================================
// Updates
// ============================================================================

/// Given two stored AIPs in a session
/// When an update campaign adds a tag to the session
/// Then one update per AIP is created and applied
/// And each updated AIP gets its manifest saved with a new checksum
#[tokio::test]
async fn test_update_campaign_updates_aips_then_saves_manifest() {
    let h = create_harness().await.unwrap();
    let (_, first) = seed_stored_aip(&h.ctx.db, "s1", "P1").await.unwrap();
    let (_, second) = seed_stored_aip(&h.ctx.db, "s1", "P2").await.unwrap();
    seed_stored_aip(&h.ctx.db, "s2", "P3").await.unwrap();

    let campaign = IngestService::new(h.ctx.clone())
        .schedule_aip_updates(criteria("s1"), vec![AipUpdateTask::AddTags(vec!["new".to_string()])])
        .await
        .unwrap();
    assert_eq!(campaign.state(), Some(RequestState::Created));

    assert_eq!(run_type(&h, RequestType::AipUpdatesCreator).await, 1);
    assert!(requests_of_type(&h.ctx, RequestType::AipUpdatesCreator).await.unwrap().is_empty());
    let updates = requests_of_type(&h.ctx, RequestType::AipUpdate).await.unwrap();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|r| r.state == RequestState::Created));

    assert_eq!(run_type(&h, RequestType::AipUpdate).await, 2);
    assert!(requests_of_type(&h.ctx, RequestType::AipUpdate).await.unwrap().is_empty());
    for id in [first.id, second.id] {
        let aip = aips::find_aip(&h.ctx.db, id).await.unwrap().unwrap();
        assert!(aip.tags.contains(&"new".to_string()));
    }

    let saves = requests_of_type(&h.ctx, RequestType::AipStoreMetadata).await.unwrap();
    assert_eq!(saves.len(), 2);
    assert_eq!(run_type(&h, RequestType::AipStoreMetadata).await, 2);
    assert_eq!(h.storage.stored().len(), 2);
    confirm_all(&h).await;

    assert!(requests_of_type(&h.ctx, RequestType::AipStoreMetadata).await.unwrap().is_empty());
    for id in [first.id, second.id] {
        let aip = aips::find_aip(&h.ctx.db, id).await.unwrap().unwrap();
        assert!(aip.manifest_checksum.is_some());
    }
}

#[tokio::test]
async fn test_update_that_changes_nothing_saves_no_manifest() {
    let h = create_harness().await.unwrap();
    let (_, aip) = seed_stored_aip(&h.ctx.db, "s1", "P1").await.unwrap();
    let service = RequestService::new(h.ctx.clone());

    service
        .register(RequestDraft::aip_update(aip.id, AipUpdateTask::RemoveTags(vec!["absent".to_string()])))
        .await
        .unwrap();
    run_type(&h, RequestType::AipUpdate).await;

    assert!(requests_of_type(&h.ctx, RequestType::AipUpdate).await.unwrap().is_empty());
    assert!(requests_of_type(&h.ctx, RequestType::AipStoreMetadata).await.unwrap().is_empty());
}

/// Given a stored AIP on `disk`
/// When an update removes the `disk` storage
/// Then its files there are deleted remotely and the update waits
/// And it succeeds once the deletion is confirmed
#[tokio::test]
async fn test_storage_removal_waits_for_file_deletion() {
    let h = create_harness().await.unwrap();
    let (_, aip) = seed_stored_aip(&h.ctx.db, "s1", "P1").await.unwrap();
    let service = RequestService::new(h.ctx.clone());

    let update = service
        .register(RequestDraft::aip_update(aip.id, AipUpdateTask::RemoveStorages(vec!["disk".to_string()])))
        .await
        .unwrap();
    run_type(&h, RequestType::AipUpdate).await;

    let deleted = h.storage.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].1.len(), 1);
    assert_eq!(deleted[0].1[0].storage, "disk");
    let waiting = service.find(registered_id(&update)).await.unwrap();
    assert_eq!(waiting.state, RequestState::Running);
    assert_eq!(waiting.group_ids, vec![deleted[0].0.clone()]);

    h.storage.complete(RemoteOutcome::new(deleted[0].0.clone(), RemoteStatus::Success));
    Reconciler::new(h.ctx.clone()).poll_pending().await.unwrap();

    assert!(requests_of_type(&h.ctx, RequestType::AipUpdate).await.unwrap().is_empty());
    let updated = aips::find_aip(&h.ctx.db, aip.id).await.unwrap().unwrap();
    assert!(updated.storages.is_empty());
    assert_eq!(requests_of_type(&h.ctx, RequestType::AipStoreMetadata).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_metadata_blocks_update_on_same_aip_only() {
    let h = create_harness().await.unwrap();
    let (_, a) = seed_stored_aip(&h.ctx.db, "s1", "P1").await.unwrap();
    let (_, b) = seed_stored_aip(&h.ctx.db, "s1", "P2").await.unwrap();
    let service = RequestService::new(h.ctx.clone());

    service
        .register(RequestDraft::store_metadata(a.id, false, false))
        .await
        .unwrap();
    let same = service
        .register(RequestDraft::aip_update(a.id, AipUpdateTask::AddTags(vec!["x".to_string()])))
        .await
        .unwrap();
    let other = service
        .register(RequestDraft::aip_update(b.id, AipUpdateTask::AddTags(vec!["x".to_string()])))
        .await
        .unwrap();

    assert_eq!(same.state(), Some(RequestState::Blocked));
    assert_eq!(other.state(), Some(RequestState::Created));
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn test_session_deletion_by_state_keeps_rows() {
    let h = create_harness().await.unwrap();
    let (sip, aip) = seed_stored_aip(&h.ctx.db, "s1", "P1").await.unwrap();

    IngestService::new(h.ctx.clone())
        .schedule_session_deletion("owner", "s1", DeletionMode::ByState, false)
        .await
        .unwrap();
    assert_eq!(run_type(&h, RequestType::OaisDeletion).await, 1);

    assert!(requests_of_type(&h.ctx, RequestType::OaisDeletion).await.unwrap().is_empty());
    assert!(h.storage.deleted().is_empty());
    let sip = sips::find_sip(&h.ctx.db, sip.id).await.unwrap().unwrap();
    assert_eq!(sip.state, SipState::Deleted);
    let aip = aips::find_aip(&h.ctx.db, aip.id).await.unwrap().unwrap();
    assert_eq!(aip.state, AipState::Deleted);
}

/// Given a stored SIP in a session
/// When the session is deleted irrevocably with its files
/// Then a storage deletion waits behind the session deletion
/// And the SIP and AIP rows disappear once storage confirms
#[tokio::test]
async fn test_session_deletion_with_files_removes_entities_after_confirmation() {
    let h = create_harness().await.unwrap();
    let (sip, aip) = seed_stored_aip(&h.ctx.db, "s1", "P1").await.unwrap();

    IngestService::new(h.ctx.clone())
        .schedule_session_deletion("owner", "s1", DeletionMode::Irrevocably, true)
        .await
        .unwrap();
    run_type(&h, RequestType::OaisDeletion).await;

    let storage_deletions = requests_of_type(&h.ctx, RequestType::StorageDeletion).await.unwrap();
    assert_eq!(storage_deletions.len(), 1);
    assert_eq!(storage_deletions[0].state, RequestState::Created);
    assert_eq!(storage_deletions[0].sip_entity_id, Some(sip.id));
    assert!(sips::find_sip(&h.ctx.db, sip.id).await.unwrap().is_some());

    assert_eq!(run_type(&h, RequestType::StorageDeletion).await, 1);
    let deleted = h.storage.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].1[0].owner, aip.aip_id);

    confirm_all(&h).await;

    assert!(requests_of_type(&h.ctx, RequestType::StorageDeletion).await.unwrap().is_empty());
    assert!(sips::find_sip(&h.ctx.db, sip.id).await.unwrap().is_none());
    assert!(aips::find_aip(&h.ctx.db, aip.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_file_deletion_keeps_entities() {
    let h = create_harness().await.unwrap();
    let (sip, _) = seed_stored_aip(&h.ctx.db, "s1", "P1").await.unwrap();
    let service = RequestService::new(h.ctx.clone());

    let deletion = service
        .register(RequestDraft::storage_deletion(sip.id, DeletionMode::Irrevocably))
        .await
        .unwrap();
    run_type(&h, RequestType::StorageDeletion).await;
    let (group_id, _) = h.storage.deleted().remove(0);

    Reconciler::new(h.ctx.clone())
        .handle_storage_results(&RemoteOutcome::new(group_id, RemoteStatus::Denied))
        .await
        .unwrap();

    let request = service.find(registered_id(&deletion)).await.unwrap();
    assert_eq!(request.state, RequestState::Error);
    assert_eq!(request.errors, vec!["storage request denied".to_string()]);
    let sip = sips::find_sip(&h.ctx.db, sip.id).await.unwrap().unwrap();
    assert_eq!(sip.state, SipState::Error);
}

// ============================================================================
// Worker recovery
// ============================================================================

const STOPPED_WORKER: &str = "stopped-worker";

/// Given a job claimed by a worker that stopped before finishing it
/// When its lease runs out and a worker recovers jobs
/// Then the job is FAILED and its requests go to ERROR
#[tokio::test]
async fn test_recover_fails_jobs_with_expired_lease() {
    let h = create_harness().await.unwrap();
    let metadata = helpers::ingest_metadata("s1");
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(metadata, vec![SipDescriptor::new("P1")])
        .await
        .unwrap();
    let report = Scheduler::new(h.ctx.clone())
        .schedule(RequestType::Ingest)
        .await
        .unwrap();
    let claimed = jobs::claim_next_queued(&h.ctx.db, STOPPED_WORKER).await.unwrap().unwrap();
    assert_eq!(claimed.id, report.jobs[0]);

    let worker = Worker::new(h.ctx.clone());
    assert_eq!(worker.recover().await.unwrap(), 0, "lease still held");
    let job = jobs::find_job(&h.ctx.db, claimed.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);

    assert_eq!(expire_job_leases(&h.ctx.db).await.unwrap(), 1);
    assert_eq!(worker.recover().await.unwrap(), 1);

    let job = jobs::find_job(&h.ctx.db, claimed.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.locked);
    let request = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().remove(0);
    assert_eq!(request.state, RequestState::Error);
    assert!(request.errors[0].contains("interrupted"));

    assert!(!jobs::finish_job(&h.ctx.db, claimed.id, STOPPED_WORKER, JobStatus::Succeeded, None)
        .await
        .unwrap());
    assert_eq!(worker.recover().await.unwrap(), 0);
    assert_eq!(worker.drain().await.unwrap(), 0);
}

/// Given a job whose worker stopped after storage was requested
/// When the job is recovered and storage then confirms the files
/// Then the request was kept waiting and the SIP ends up STORED
#[tokio::test]
async fn test_recover_keeps_requests_awaiting_storage() {
    let h = create_harness().await.unwrap();
    IngestService::new(h.ctx.clone())
        .handle_sip_collection(
            helpers::ingest_metadata("s1"),
            vec![SipDescriptor::new("P1").with_file(data_file("P1-a"))],
        )
        .await
        .unwrap();
    Scheduler::new(h.ctx.clone())
        .schedule(RequestType::Ingest)
        .await
        .unwrap();
    let claimed = jobs::claim_next_queued(&h.ctx.db, STOPPED_WORKER).await.unwrap().unwrap();
    JobExecutor::new(h.ctx.clone()).execute(&claimed).await.unwrap();

    expire_job_leases(&h.ctx.db).await.unwrap();
    assert_eq!(Worker::new(h.ctx.clone()).recover().await.unwrap(), 0);
    let job = jobs::find_job(&h.ctx.db, claimed.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let request = requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().remove(0);
    assert_eq!(request.state, RequestState::Running);
    assert_eq!(request.group_ids.len(), 1);

    confirm_all(&h).await;

    assert!(requests_of_type(&h.ctx, RequestType::Ingest).await.unwrap().is_empty());
    let sip = sips::find_by_session(&h.ctx.db, "owner", "s1").await.unwrap().remove(0);
    assert_eq!(sip.state, SipState::Stored);
    for aip in aips::find_by_sip(&h.ctx.db, sip.id).await.unwrap() {
        assert_eq!(aip.state, AipState::Stored);
    }
}
