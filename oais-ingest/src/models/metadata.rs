//! Ingest metadata submitted alongside a SIP collection

use serde::{Deserialize, Serialize};

use super::aip::StorageMetadata;

/// Session, chain and storage targets shared by every SIP of a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestMetadata {
    pub session_owner: String,
    pub session: String,
    /// Processing chain name, resolved through the chain registry
    pub chain: String,
    pub storages: Vec<StorageMetadata>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl IngestMetadata {
    pub fn new(session_owner: &str, session: &str, chain: &str) -> Self {
        Self {
            session_owner: session_owner.to_string(),
            session: session.to_string(),
            chain: chain.to_string(),
            storages: Vec::new(),
            categories: Vec::new(),
        }
    }

    pub fn with_storage(mut self, storage: StorageMetadata) -> Self {
        self.storages.push(storage);
        self
    }

    /// Structural checks; chain existence is checked by the caller
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.session_owner.trim().is_empty() {
            errors.push("Session owner is required".to_string());
        }
        if self.session.trim().is_empty() {
            errors.push("Session is required".to_string());
        }
        if self.chain.trim().is_empty() {
            errors.push("Processing chain is required".to_string());
        }
        if self.storages.is_empty() {
            errors.push("At least one storage target is required".to_string());
        }
        if self.storages.iter().any(|s| s.storage.trim().is_empty()) {
            errors.push("Storage name is required".to_string());
        }
        errors
    }
}
