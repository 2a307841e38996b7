//! Submission Information Package models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Checksum algorithms accepted on data files
pub const SUPPORTED_ALGORITHMS: [&str; 3] = ["MD5", "SHA-1", "SHA-256"];

/// One data file referenced by a SIP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub filename: String,
    pub checksum: String,
    pub algorithm: String,
    pub mime_type: String,
    /// Where the storage service fetches the file from
    #[serde(default)]
    pub origin_url: Option<String>,
}

/// Raw SIP as submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipDescriptor {
    pub provider_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub files: Vec<DataFile>,
}

impl SipDescriptor {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            tags: Vec::new(),
            properties: BTreeMap::new(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: DataFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Structural checks done at submission time
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.provider_id.trim().is_empty() {
            errors.push("SIP provider id is required".to_string());
        }
        for file in &self.files {
            if file.filename.trim().is_empty() {
                errors.push("Data file name is required".to_string());
            }
            if file.checksum.trim().is_empty() {
                errors.push(format!("Data file {} has no checksum", file.filename));
            }
            if !SUPPORTED_ALGORITHMS.contains(&file.algorithm.as_str()) {
                errors.push(format!(
                    "Data file {} uses unsupported checksum algorithm {}",
                    file.filename, file.algorithm
                ));
            }
        }
        errors
    }

    /// SHA-256 of the canonical JSON form (properties are key-ordered)
    pub fn checksum(&self) -> serde_json::Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

/// SIP lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SipState {
    /// Saved by the init step, chain not finished
    Created,
    /// Chain finished, AIPs generated
    Ingested,
    /// Every AIP stored
    Stored,
    /// Logically deleted
    Deleted,
    Error,
}

impl SipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipState::Created => "CREATED",
            SipState::Ingested => "INGESTED",
            SipState::Stored => "STORED",
            SipState::Deleted => "DELETED",
            SipState::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> oais_common::Result<Self> {
        match value {
            "CREATED" => Ok(SipState::Created),
            "INGESTED" => Ok(SipState::Ingested),
            "STORED" => Ok(SipState::Stored),
            "DELETED" => Ok(SipState::Deleted),
            "ERROR" => Ok(SipState::Error),
            other => Err(oais_common::Error::Internal(format!("Unknown SIP state: {}", other))),
        }
    }
}

/// Persisted SIP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipEntity {
    pub id: i64,
    /// `URN:SIP:<uuid>:V<version>`
    pub sip_id: String,
    pub provider_id: String,
    pub version: i64,
    pub checksum: String,
    pub session_owner: String,
    pub session: String,
    pub state: SipState,
    pub sip: SipDescriptor,
    pub errors: Vec<String>,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl SipEntity {
    /// Fresh, not yet persisted entity (`id` is 0)
    pub fn new(
        sip: SipDescriptor,
        session_owner: &str,
        session: &str,
        version: i64,
        checksum: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            sip_id: sip_urn(version),
            provider_id: sip.provider_id.clone(),
            version,
            checksum,
            session_owner: session_owner.to_string(),
            session: session.to_string(),
            state: SipState::Created,
            sip,
            errors: Vec::new(),
            creation_date: now,
            last_update: now,
        }
    }
}

pub fn sip_urn(version: i64) -> String {
    format!("URN:SIP:{}:V{}", uuid::Uuid::new_v4(), version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> DataFile {
        DataFile {
            filename: name.to_string(),
            checksum: "abc123".to_string(),
            algorithm: "MD5".to_string(),
            mime_type: "application/octet-stream".to_string(),
            origin_url: Some(format!("file:///data/{}", name)),
        }
    }

    #[test]
    fn test_valid_sip_has_no_errors() {
        let sip = SipDescriptor::new("SIP_001").with_file(file("a.dat"));
        assert!(sip.validate().is_empty());
    }

    #[test]
    fn test_blank_provider_and_bad_algorithm_reported() {
        let mut bad = file("b.dat");
        bad.algorithm = "CRC32".to_string();
        let sip = SipDescriptor::new("  ").with_file(bad);

        let errors = sip.validate();
        assert_eq!(errors.len(), 2);
        assert!(errors[1].contains("CRC32"));
    }

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        let mut a = SipDescriptor::new("SIP_001");
        a.properties.insert("b".into(), serde_json::json!(2));
        a.properties.insert("a".into(), serde_json::json!(1));
        let mut b = SipDescriptor::new("SIP_001");
        b.properties.insert("a".into(), serde_json::json!(1));
        b.properties.insert("b".into(), serde_json::json!(2));

        assert_eq!(a.checksum().unwrap(), b.checksum().unwrap());
        assert_ne!(
            a.checksum().unwrap(),
            SipDescriptor::new("SIP_002").checksum().unwrap()
        );
    }

    #[test]
    fn test_sip_urn_carries_version() {
        assert!(sip_urn(3).starts_with("URN:SIP:"));
        assert!(sip_urn(3).ends_with(":V3"));
    }
}
