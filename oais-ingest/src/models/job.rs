//! Asynchronous job records
//!
//! A job is one unit of work carrying the ids of the requests it executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::RequestType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> oais_common::Result<Self> {
        match value {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(oais_common::Error::Internal(format!("Unknown job status: {}", other))),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Work handed to a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUnit {
    pub request_type: RequestType,
    /// Processing chain, ingest units only
    pub chain: Option<String>,
    pub request_ids: Vec<i64>,
}

/// Returned by a dispatcher once a unit is enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: i64,
}

/// Persisted job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: i64,
    pub request_type: RequestType,
    pub chain: Option<String>,
    pub request_ids: Vec<i64>,
    pub status: JobStatus,
    /// Locked jobs are kept by the purge (a request of theirs failed)
    pub locked: bool,
    pub error: Option<String>,
    /// Worker holding a RUNNING job
    pub owner: Option<String>,
    /// Last lease renewal by the owner
    pub heartbeat: Option<DateTime<Utc>>,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}
