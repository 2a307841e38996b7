//! Remote storage service client
//!
//! Store and delete calls only hand the files over and return a group id;
//! the file-level results come back later as a [`RemoteOutcome`] for that
//! group id and are fed to the reconciler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{IngestError, IngestResult};

const USER_AGENT: &str = "oais-ingest/0.1.0";

/// One file to store on one storage location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStorageRequest {
    /// Owning AIP URN
    pub owner: String,
    pub session_owner: String,
    pub session: String,
    pub filename: String,
    pub checksum: String,
    pub algorithm: String,
    pub mime_type: String,
    pub storage: String,
    pub store_path: Option<String>,
    /// Where the storage service fetches the file from
    pub origin_url: Option<String>,
    /// Inline file content (AIP manifests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One stored file to delete from one storage location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDeletionRequest {
    pub owner: String,
    pub session_owner: String,
    pub session: String,
    pub checksum: String,
    pub storage: String,
}

/// Group-level status reported by the storage service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteStatus {
    /// Accepted, results will follow
    Granted,
    /// Refused as a whole
    Denied,
    Success,
    Error,
}

/// File-level result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub owner: String,
    pub checksum: String,
    pub storage: String,
    /// Error cause, failed files only
    pub message: Option<String>,
}

/// Result batch for one group id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOutcome {
    pub group_id: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub results: Vec<RemoteResult>,
}

impl RemoteOutcome {
    pub fn new(group_id: impl Into<String>, status: RemoteStatus) -> Self {
        Self {
            group_id: group_id.into(),
            status,
            results: Vec::new(),
        }
    }

    pub fn with_result(mut self, result: RemoteResult) -> Self {
        self.results.push(result);
        self
    }

    /// Error causes, translated for entity error lists
    pub fn error_messages(&self) -> Vec<String> {
        let mut messages: Vec<String> = self
            .results
            .iter()
            .filter_map(|r| {
                r.message.as_ref().map(|m| {
                    format!("Storage {} failed for file {} of {}: {}", r.storage, r.checksum, r.owner, m)
                })
            })
            .collect();

        if messages.is_empty() {
            messages.push(match self.status {
                RemoteStatus::Denied => "storage request denied".to_string(),
                _ => format!("storage request {} failed", self.group_id),
            });
        }
        messages
    }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Submit files for storage; returns the group id
    async fn store(&self, files: Vec<FileStorageRequest>) -> IngestResult<String>;

    /// Submit stored files for deletion; returns the group id
    async fn delete(&self, files: Vec<FileDeletionRequest>) -> IngestResult<String>;

    /// Results for a group id, `None` while still pending
    async fn poll(&self, group_id: &str) -> IngestResult<Option<RemoteOutcome>>;
}

#[derive(Debug, Deserialize)]
struct GroupResponse {
    group_id: String,
}

#[derive(Debug, Serialize)]
struct StoreBody<'a> {
    files: &'a [FileStorageRequest],
}

#[derive(Debug, Serialize)]
struct DeleteBody<'a> {
    files: &'a [FileDeletionRequest],
}

/// JSON over HTTP storage client
///
/// Without a base URL every call fails, which turns storage steps into
/// remote errors instead of leaving requests waiting forever.
pub struct HttpStorageClient {
    http_client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpStorageClient {
    pub fn new(base_url: Option<String>, request_timeout_ms: u64) -> IngestResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    fn url(&self, path: &str) -> IngestResult<String> {
        match &self.base_url {
            Some(base) => Ok(format!("{}{}", base, path)),
            None => Err(IngestError::Storage("no storage service configured".to_string())),
        }
    }

    async fn submit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> IngestResult<String> {
        let url = self.url(path)?;

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(IngestError::Storage(format!(
                "{} returned {}: {}",
                url,
                status.as_u16(),
                error_text
            )));
        }

        let group: GroupResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Storage(format!("Invalid response from {}: {}", url, e)))?;

        tracing::debug!(group_id = %group.group_id, url = %url, "Storage request accepted");
        Ok(group.group_id)
    }
}

#[async_trait]
impl StorageClient for HttpStorageClient {
    async fn store(&self, files: Vec<FileStorageRequest>) -> IngestResult<String> {
        self.submit("/storage/store", &StoreBody { files: &files }).await
    }

    async fn delete(&self, files: Vec<FileDeletionRequest>) -> IngestResult<String> {
        self.submit("/storage/delete", &DeleteBody { files: &files }).await
    }

    async fn poll(&self, group_id: &str) -> IngestResult<Option<RemoteOutcome>> {
        let url = self.url(&format!("/storage/groups/{}", group_id))?;

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let outcome: RemoteOutcome = response
                    .json()
                    .await
                    .map_err(|e| IngestError::Storage(format!("Invalid response from {}: {}", url, e)))?;
                Ok(Some(outcome))
            }
            status => Err(IngestError::Storage(format!("{} returned {}", url, status.as_u16()))),
        }
    }
}
