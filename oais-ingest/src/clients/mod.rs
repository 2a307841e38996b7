//! Collaborator interfaces
//!
//! Remote storage, session progress reporting and job dispatch, each behind
//! a trait so the services can run against real backends or the recording
//! doubles in [`memory`].

pub mod dispatch;
pub mod memory;
pub mod notifier;
pub mod storage;

pub use dispatch::{DbJobDispatcher, JobDispatcher};
pub use notifier::{EventBusNotifier, SessionNotification, SessionNotifier};
pub use storage::{
    FileDeletionRequest, FileStorageRequest, HttpStorageClient, RemoteOutcome, RemoteResult,
    RemoteStatus, StorageClient,
};
