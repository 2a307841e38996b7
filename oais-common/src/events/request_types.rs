//! Request type and request state enums
//!
//! Shared between the request store (persisted as their `as_str` form) and
//! lifecycle events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Kind of asynchronous request handled by the ingestion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// SIP ingestion through a processing chain
    Ingest,
    /// Macro update, expands into one AipUpdate per matching AIP
    AipUpdatesCreator,
    /// Micro update on one AIP
    AipUpdate,
    /// Save the AIP manifest to its storages
    AipStoreMetadata,
    /// Session-wide deletion of SIPs and AIPs
    OaisDeletion,
    /// Removal of one SIP's stored files
    StorageDeletion,
}

impl RequestType {
    pub const ALL: [RequestType; 6] = [
        RequestType::Ingest,
        RequestType::AipUpdatesCreator,
        RequestType::AipUpdate,
        RequestType::AipStoreMetadata,
        RequestType::OaisDeletion,
        RequestType::StorageDeletion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Ingest => "INGEST",
            RequestType::AipUpdatesCreator => "AIP_UPDATES_CREATOR",
            RequestType::AipUpdate => "AIP_UPDATE",
            RequestType::AipStoreMetadata => "AIP_STORE_METADATA",
            RequestType::OaisDeletion => "OAIS_DELETION",
            RequestType::StorageDeletion => "STORAGE_DELETION",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown request type: {}", s)))
    }
}

/// Persisted request state
///
/// Success is not a stored state: a successful request is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestState {
    /// Eligible for scheduling
    Created,
    /// Claimed by the scheduler, work dispatched
    Running,
    /// Waiting for a conflicting request to finish
    Blocked,
    /// Failed, kept for inspection or retry
    Error,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Created => "CREATED",
            RequestState::Running => "RUNNING",
            RequestState::Blocked => "BLOCKED",
            RequestState::Error => "ERROR",
        }
    }

    /// Terminal for conflict evaluation
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Error)
    }

    /// CREATED or RUNNING
    pub fn is_active(&self) -> bool {
        matches!(self, RequestState::Created | RequestState::Running)
    }

    /// Allowed lifecycle edges.
    ///
    /// RUNNING → CREATED is the reclaim edge for work that never got a job;
    /// ERROR → CREATED/BLOCKED is the operator retry edge.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Blocked)
                | (Blocked, Created)
                | (Running, Error)
                | (Running, Created)
                | (Error, Created)
                | (Error, Blocked)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(RequestState::Created),
            "RUNNING" => Ok(RequestState::Running),
            "BLOCKED" => Ok(RequestState::Blocked),
            "ERROR" => Ok(RequestState::Error),
            other => Err(Error::InvalidInput(format!("Unknown request state: {}", other))),
        }
    }
}
