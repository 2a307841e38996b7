//! Request models
//!
//! A request is a persisted, asynchronous operation on SIPs/AIPs. The variant
//! specific part lives in [`RequestPayload`] (stored as JSON), the common part
//! in [`Request`]. State changes go through the request service; this module
//! only carries data and local transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use oais_common::events::{RequestState, RequestType};

use super::aip::{AipEntity, AipState};
use super::metadata::IngestMetadata;
use super::sip::SipDescriptor;

/// Progress of an ingest request through the chain and remote storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestStep {
    LocalScheduled,
    LocalInit,
    LocalPreProcessing,
    LocalValidation,
    LocalGeneration,
    LocalTagging,
    LocalPostProcessing,
    LocalFinal,
    /// Waiting for the storage service callback
    RemoteStorageRequested,
    LocalDenied,
}

impl IngestStep {
    /// Remote steps carry a deadline on the request
    pub fn is_remote(&self) -> bool {
        matches!(self, IngestStep::RemoteStorageRequested)
    }

    /// Label used in step-specific error messages
    pub fn label(&self) -> &'static str {
        match self {
            IngestStep::LocalScheduled => "scheduling",
            IngestStep::LocalInit => "init",
            IngestStep::LocalPreProcessing => "preprocessing",
            IngestStep::LocalValidation => "validation",
            IngestStep::LocalGeneration => "generation",
            IngestStep::LocalTagging => "tagging",
            IngestStep::LocalPostProcessing => "postprocessing",
            IngestStep::LocalFinal => "final",
            IngestStep::RemoteStorageRequested => "remote storage",
            IngestStep::LocalDenied => "denied",
        }
    }
}

/// How deleted SIPs/AIPs are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionMode {
    /// Keep the rows, mark them DELETED
    ByState,
    /// Remove the rows
    Irrevocably,
}

/// One update applied to an AIP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AipUpdateTask {
    AddTags(Vec<String>),
    RemoveTags(Vec<String>),
    AddCategories(Vec<String>),
    RemoveCategories(Vec<String>),
    /// Drop storage locations; stored files there are deleted remotely
    RemoveStorages(Vec<String>),
}

impl AipUpdateTask {
    /// Apply to an AIP in place; returns true when the AIP changed
    pub fn apply(&self, aip: &mut AipEntity) -> bool {
        fn add(target: &mut Vec<String>, values: &[String]) -> bool {
            let before = target.len();
            for v in values {
                if !target.contains(v) {
                    target.push(v.clone());
                }
            }
            target.len() != before
        }
        fn remove(target: &mut Vec<String>, values: &[String]) -> bool {
            let before = target.len();
            target.retain(|v| !values.contains(v));
            target.len() != before
        }

        match self {
            AipUpdateTask::AddTags(v) => add(&mut aip.tags, v),
            AipUpdateTask::RemoveTags(v) => remove(&mut aip.tags, v),
            AipUpdateTask::AddCategories(v) => add(&mut aip.categories, v),
            AipUpdateTask::RemoveCategories(v) => remove(&mut aip.categories, v),
            AipUpdateTask::RemoveStorages(v) => {
                let before = aip.storages.len();
                aip.storages.retain(|s| !v.contains(&s.storage));
                aip.storages.len() != before
            }
        }
    }

    /// Storages this task removes (empty for local-only tasks)
    pub fn removed_storages(&self) -> &[String] {
        match self {
            AipUpdateTask::RemoveStorages(v) => v,
            _ => &[],
        }
    }

    fn validate(&self) -> Vec<String> {
        let values = match self {
            AipUpdateTask::AddTags(v)
            | AipUpdateTask::RemoveTags(v)
            | AipUpdateTask::AddCategories(v)
            | AipUpdateTask::RemoveCategories(v)
            | AipUpdateTask::RemoveStorages(v) => v,
        };
        if values.is_empty() {
            vec!["Update task has no values".to_string()]
        } else {
            Vec::new()
        }
    }
}

/// AIP selection for the updates creator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub session_owner: String,
    pub session: String,
    /// Empty selects every provider id
    #[serde(default)]
    pub provider_ids: Vec<String>,
    #[serde(default)]
    pub state: Option<AipState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    pub metadata: IngestMetadata,
    pub sip: SipDescriptor,
    pub step: IngestStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatesCreatorPayload {
    pub criteria: SearchCriteria,
    pub tasks: Vec<AipUpdateTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AipUpdatePayload {
    pub task: AipUpdateTask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadataPayload {
    /// Delete the previously stored manifest once the new one is saved
    pub remove_current: bool,
    pub compute_checksum: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OaisDeletionPayload {
    pub deletion_mode: DeletionMode,
    /// Remove stored files through storage deletion requests
    pub delete_files: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDeletionPayload {
    pub deletion_mode: DeletionMode,
}

/// Variant specific request data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPayload {
    Ingest(IngestPayload),
    AipUpdatesCreator(UpdatesCreatorPayload),
    AipUpdate(AipUpdatePayload),
    AipStoreMetadata(StoreMetadataPayload),
    OaisDeletion(OaisDeletionPayload),
    StorageDeletion(StorageDeletionPayload),
}

impl RequestPayload {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestPayload::Ingest(_) => RequestType::Ingest,
            RequestPayload::AipUpdatesCreator(_) => RequestType::AipUpdatesCreator,
            RequestPayload::AipUpdate(_) => RequestType::AipUpdate,
            RequestPayload::AipStoreMetadata(_) => RequestType::AipStoreMetadata,
            RequestPayload::OaisDeletion(_) => RequestType::OaisDeletion,
            RequestPayload::StorageDeletion(_) => RequestType::StorageDeletion,
        }
    }

    /// Payload checks done before persistence
    pub fn validate(&self) -> Vec<String> {
        match self {
            RequestPayload::Ingest(p) => {
                let mut errors = p.metadata.validate();
                errors.extend(p.sip.validate());
                errors
            }
            RequestPayload::AipUpdatesCreator(p) => {
                if p.tasks.is_empty() {
                    vec!["No update task given".to_string()]
                } else {
                    p.tasks.iter().flat_map(|t| t.validate()).collect()
                }
            }
            RequestPayload::AipUpdate(p) => p.task.validate(),
            RequestPayload::AipStoreMetadata(_)
            | RequestPayload::OaisDeletion(_)
            | RequestPayload::StorageDeletion(_) => Vec::new(),
        }
    }
}

/// What a new request targets; resolved against the entity store on register
#[derive(Debug, Clone, PartialEq)]
pub enum RequestTarget {
    Session {
        session_owner: String,
        session: String,
    },
    Sip(i64),
    Aip(i64),
}

/// A request not yet registered
#[derive(Debug, Clone)]
pub struct RequestDraft {
    pub target: RequestTarget,
    pub payload: RequestPayload,
}

impl RequestDraft {
    pub fn ingest(metadata: IngestMetadata, sip: SipDescriptor) -> Self {
        Self {
            target: RequestTarget::Session {
                session_owner: metadata.session_owner.clone(),
                session: metadata.session.clone(),
            },
            payload: RequestPayload::Ingest(IngestPayload {
                metadata,
                sip,
                step: IngestStep::LocalScheduled,
            }),
        }
    }

    pub fn updates_creator(criteria: SearchCriteria, tasks: Vec<AipUpdateTask>) -> Self {
        Self {
            target: RequestTarget::Session {
                session_owner: criteria.session_owner.clone(),
                session: criteria.session.clone(),
            },
            payload: RequestPayload::AipUpdatesCreator(UpdatesCreatorPayload { criteria, tasks }),
        }
    }

    pub fn aip_update(aip_entity_id: i64, task: AipUpdateTask) -> Self {
        Self {
            target: RequestTarget::Aip(aip_entity_id),
            payload: RequestPayload::AipUpdate(AipUpdatePayload { task }),
        }
    }

    pub fn store_metadata(aip_entity_id: i64, remove_current: bool, compute_checksum: bool) -> Self {
        Self {
            target: RequestTarget::Aip(aip_entity_id),
            payload: RequestPayload::AipStoreMetadata(StoreMetadataPayload {
                remove_current,
                compute_checksum,
            }),
        }
    }

    pub fn oais_deletion(
        session_owner: &str,
        session: &str,
        deletion_mode: DeletionMode,
        delete_files: bool,
    ) -> Self {
        Self {
            target: RequestTarget::Session {
                session_owner: session_owner.to_string(),
                session: session.to_string(),
            },
            payload: RequestPayload::OaisDeletion(OaisDeletionPayload {
                deletion_mode,
                delete_files,
            }),
        }
    }

    pub fn storage_deletion(sip_entity_id: i64, deletion_mode: DeletionMode) -> Self {
        Self {
            target: RequestTarget::Sip(sip_entity_id),
            payload: RequestPayload::StorageDeletion(StorageDeletionPayload { deletion_mode }),
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.payload.request_type()
    }
}

/// State change record returned by [`Request::transition_to`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub request_id: String,
    pub old_state: RequestState,
    pub new_state: RequestState,
    pub transitioned_at: DateTime<Utc>,
}

/// Persisted request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Surrogate id; creation order
    pub id: i64,
    /// External correlation id returned to submitters
    pub request_id: String,
    pub state: RequestState,
    pub session_owner: String,
    pub session: String,
    pub provider_id: Option<String>,
    pub sip_entity_id: Option<i64>,
    pub aip_entity_id: Option<i64>,
    pub job_id: Option<i64>,
    pub payload: RequestPayload,
    pub errors: Vec<String>,
    /// Remote storage group ids still awaited
    pub group_ids: Vec<String>,
    pub remote_step_deadline: Option<DateTime<Utc>>,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Request {
    pub fn request_type(&self) -> RequestType {
        self.payload.request_type()
    }

    /// Change state locally; persistence is the caller's job
    pub fn transition_to(&mut self, new_state: RequestState) -> StateTransition {
        let transition = StateTransition {
            request_id: self.request_id.clone(),
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;
        self.last_update = transition.transitioned_at;
        transition
    }

    pub fn ingest_payload(&self) -> Option<&IngestPayload> {
        match &self.payload {
            RequestPayload::Ingest(p) => Some(p),
            _ => None,
        }
    }

    /// Record the ingest step; remote steps need a deadline
    pub fn set_ingest_step(&mut self, step: IngestStep, deadline: Option<DateTime<Utc>>) {
        if let RequestPayload::Ingest(p) = &mut self.payload {
            p.step = step;
            self.remote_step_deadline = if step.is_remote() { deadline } else { None };
        }
    }

    pub fn ingest_step(&self) -> Option<IngestStep> {
        self.ingest_payload().map(|p| p.step)
    }
}
