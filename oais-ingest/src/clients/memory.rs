//! In-memory collaborators for tests and local development.
//!
//! Each double records what it was asked to do and can be told to fail, so
//! the full pipeline can be driven without a storage service.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: nothing is persisted or sent anywhere
//! - [`InMemoryJobDispatcher`] does not write `jobs` rows, so nothing
//!   executes the units it accepts

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use oais_common::events::SessionStep;

use super::notifier::{SessionNotification, SessionNotifier};
use super::storage::{FileDeletionRequest, FileStorageRequest, RemoteOutcome, StorageClient};
use super::JobDispatcher;
use crate::error::{IngestError, IngestResult};
use crate::models::{JobHandle, JobUnit};

fn poison_err<T>(_: PoisonError<T>) -> IngestError {
    IngestError::Storage("in-memory client lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct StorageState {
    stored: Vec<(String, Vec<FileStorageRequest>)>,
    deleted: Vec<(String, Vec<FileDeletionRequest>)>,
    ready: HashMap<String, RemoteOutcome>,
    fail_with: Option<String>,
}

/// Storage client that hands out `group-<n>` ids
#[derive(Debug, Default)]
pub struct RecordingStorageClient {
    state: Mutex<StorageState>,
    next_group: AtomicI64,
}

impl RecordingStorageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following store/delete call fail (`None` to recover)
    pub fn fail_with(&self, message: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_with = message.map(str::to_string);
        }
    }

    /// Store calls so far, with their group ids
    pub fn stored(&self) -> Vec<(String, Vec<FileStorageRequest>)> {
        self.state.lock().map(|s| s.stored.clone()).unwrap_or_default()
    }

    /// Delete calls so far, with their group ids
    pub fn deleted(&self) -> Vec<(String, Vec<FileDeletionRequest>)> {
        self.state.lock().map(|s| s.deleted.clone()).unwrap_or_default()
    }

    /// Make an outcome available to [`StorageClient::poll`]
    pub fn complete(&self, outcome: RemoteOutcome) {
        if let Ok(mut state) = self.state.lock() {
            state.ready.insert(outcome.group_id.clone(), outcome);
        }
    }

    fn group_id(&self) -> String {
        format!("group-{}", self.next_group.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl StorageClient for RecordingStorageClient {
    async fn store(&self, files: Vec<FileStorageRequest>) -> IngestResult<String> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some(message) = &state.fail_with {
            return Err(IngestError::Storage(message.clone()));
        }
        let group_id = self.group_id();
        state.stored.push((group_id.clone(), files));
        Ok(group_id)
    }

    async fn delete(&self, files: Vec<FileDeletionRequest>) -> IngestResult<String> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some(message) = &state.fail_with {
            return Err(IngestError::Storage(message.clone()));
        }
        let group_id = self.group_id();
        state.deleted.push((group_id.clone(), files));
        Ok(group_id)
    }

    async fn poll(&self, group_id: &str) -> IngestResult<Option<RemoteOutcome>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        Ok(state.ready.remove(group_id))
    }
}

/// Session notifier keeping every notification
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<SessionNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<SessionNotification> {
        self.notifications.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Sum of counts reported for a step
    pub fn total(&self, step: SessionStep) -> u32 {
        self.notifications()
            .iter()
            .filter(|n| n.step == step)
            .map(|n| n.count)
            .sum()
    }
}

impl SessionNotifier for RecordingNotifier {
    fn notify(&self, notification: SessionNotification) {
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push(notification);
        }
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    units: Vec<(i64, JobUnit)>,
    fail_with: Option<String>,
}

/// Dispatcher that only records accepted units
#[derive(Debug, Default)]
pub struct InMemoryJobDispatcher {
    state: Mutex<DispatchState>,
    next_job: AtomicI64,
}

impl InMemoryJobDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_with = message.map(str::to_string);
        }
    }

    /// Accepted units with their job ids, in enqueue order
    pub fn units(&self) -> Vec<(i64, JobUnit)> {
        self.state.lock().map(|s| s.units.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl JobDispatcher for InMemoryJobDispatcher {
    async fn enqueue(&self, unit: JobUnit) -> IngestResult<JobHandle> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IngestError::Dispatch("in-memory dispatcher lock poisoned".to_string()))?;
        if let Some(message) = &state.fail_with {
            return Err(IngestError::Dispatch(message.clone()));
        }
        let job_id = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        state.units.push((job_id, unit));
        Ok(JobHandle { job_id })
    }
}
