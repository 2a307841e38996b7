//! Data models for oais-ingest
//!
//! SIP/AIP entities, ingest metadata, requests and jobs.

pub mod aip;
pub mod job;
pub mod metadata;
pub mod request;
pub mod sip;

pub use aip::{AipDraft, AipEntity, AipState, StorageMetadata};
pub use job::{JobHandle, JobInfo, JobStatus, JobUnit};
pub use metadata::IngestMetadata;
pub use request::{
    AipUpdatePayload, AipUpdateTask, DeletionMode, IngestPayload, IngestStep,
    OaisDeletionPayload, Request, RequestDraft, RequestPayload, RequestState, RequestTarget,
    RequestType, SearchCriteria, StateTransition, StorageDeletionPayload, StoreMetadataPayload,
    UpdatesCreatorPayload,
};
pub use sip::{DataFile, SipDescriptor, SipEntity, SipState};
