//! Archival Information Package models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sip::DataFile;

/// Target storage backend for an AIP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    pub storage: String,
    #[serde(default)]
    pub store_path: Option<String>,
}

impl StorageMetadata {
    pub fn new(storage: impl Into<String>) -> Self {
        Self {
            storage: storage.into(),
            store_path: None,
        }
    }
}

/// AIP lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AipState {
    /// Created by the generation step, files not stored yet
    Generated,
    Stored,
    Deleted,
    Error,
}

impl AipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AipState::Generated => "GENERATED",
            AipState::Stored => "STORED",
            AipState::Deleted => "DELETED",
            AipState::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> oais_common::Result<Self> {
        match value {
            "GENERATED" => Ok(AipState::Generated),
            "STORED" => Ok(AipState::Stored),
            "DELETED" => Ok(AipState::Deleted),
            "ERROR" => Ok(AipState::Error),
            other => Err(oais_common::Error::Internal(format!("Unknown AIP state: {}", other))),
        }
    }
}

/// AIP produced by a generation step, before persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AipDraft {
    pub provider_id: String,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub storages: Vec<StorageMetadata>,
    pub files: Vec<DataFile>,
}

/// Persisted AIP, owned by exactly one SIP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AipEntity {
    pub id: i64,
    /// `URN:AIP:<uuid>:V<version>`
    pub aip_id: String,
    pub sip_entity_id: i64,
    pub provider_id: String,
    pub session_owner: String,
    pub session: String,
    pub state: AipState,
    pub storages: Vec<StorageMetadata>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub files: Vec<DataFile>,
    /// Checksum of the last manifest saved to storage
    pub manifest_checksum: Option<String>,
    pub errors: Vec<String>,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl AipEntity {
    /// Build an unsaved entity from a draft (`id` is 0)
    pub fn from_draft(
        draft: AipDraft,
        sip_entity_id: i64,
        version: i64,
        session_owner: &str,
        session: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            aip_id: format!("URN:AIP:{}:V{}", uuid::Uuid::new_v4(), version),
            sip_entity_id,
            provider_id: draft.provider_id,
            session_owner: session_owner.to_string(),
            session: session.to_string(),
            state: AipState::Generated,
            storages: draft.storages,
            tags: draft.tags,
            categories: draft.categories,
            files: draft.files,
            manifest_checksum: None,
            errors: Vec::new(),
            creation_date: now,
            last_update: now,
        }
    }

    /// Manifest written to storage by the store-metadata job
    pub fn manifest(&self) -> serde_json::Value {
        serde_json::json!({
            "aip_id": self.aip_id,
            "provider_id": self.provider_id,
            "session_owner": self.session_owner,
            "session": self.session,
            "tags": self.tags,
            "categories": self.categories,
            "storages": self.storages,
            "files": self.files,
        })
    }
}
