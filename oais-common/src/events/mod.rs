//! Event types for the OAIS ingestion event system
//!
//! Provides lifecycle event definitions and the EventBus shared by the
//! request service, the schedulers, and any observer (session tracking,
//! notification relays, tests).

mod request_types;

pub use request_types::{RequestState, RequestType};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Outcome category reported to session progress observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStep {
    Granted,
    Denied,
    Success,
    Error,
}

/// One failed SIP inside a chain batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainFailure {
    pub request_id: String,
    pub provider_id: String,
    pub errors: Vec<String>,
}

/// Ingestion lifecycle events
///
/// Every request state transition is published here. Events are broadcast
/// via EventBus and are serializable for relaying to external channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// Request persisted (CREATED or BLOCKED)
    RequestRegistered {
        request_id: String,
        request_type: RequestType,
        state: RequestState,
        session_owner: String,
        session: String,
        provider_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Request refused before persistence
    RequestDenied {
        request_type: RequestType,
        session_owner: String,
        session: String,
        provider_id: Option<String>,
        reasons: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// Requests claimed by the scheduler and handed to a job
    RequestsScheduled {
        request_type: RequestType,
        request_ids: Vec<String>,
        job_id: Option<i64>,
        timestamp: DateTime<Utc>,
    },

    /// Request completed and removed
    RequestSucceeded {
        request_id: String,
        request_type: RequestType,
        session_owner: String,
        session: String,
        provider_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Request moved to ERROR
    RequestFailed {
        request_id: String,
        request_type: RequestType,
        session_owner: String,
        session: String,
        provider_id: Option<String>,
        errors: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// BLOCKED requests promoted to CREATED by an unblock scan
    RequestsUnblocked {
        request_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// RUNNING requests without a job returned to CREATED
    RequestsReclaimed {
        request_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// ERROR requests put back into the pipeline
    RequestsRetried {
        request_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A chain batch finished with at least one failed SIP
    ChainBatchFailed {
        chain: String,
        job_id: Option<i64>,
        failures: Vec<ChainFailure>,
        timestamp: DateTime<Utc>,
    },

    /// Session progress counters changed
    SessionProgress {
        session_owner: String,
        session: String,
        step: SessionStep,
        request_type: RequestType,
        count: u32,
        timestamp: DateTime<Utc>,
    },
}

/// Central event distribution bus
///
/// Thin wrapper over a tokio broadcast channel. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use oais_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unblocked(ids: &[&str]) -> IngestEvent {
        IngestEvent::RequestsUnblocked {
            request_ids: ids.iter().map(|s| s.to_string()).collect(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus = EventBus::new(10);
        assert!(bus.emit(unblocked(&["a"])).is_err());
        bus.emit_lossy(unblocked(&["a"]));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(unblocked(&["r1", "r2"])).unwrap();

        match rx.recv().await.unwrap() {
            IngestEvent::RequestsUnblocked { request_ids, .. } => {
                assert_eq!(request_ids, vec!["r1".to_string(), "r2".to_string()]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = IngestEvent::SessionProgress {
            session_owner: "owner".into(),
            session: "s1".into(),
            step: SessionStep::Denied,
            request_type: RequestType::Ingest,
            count: 2,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SessionProgress");
        assert_eq!(json["step"], "DENIED");
        assert_eq!(json["request_type"], "INGEST");
    }

    #[test]
    fn test_cloned_bus_shares_channel() {
        let bus = EventBus::new(10);
        let clone = bus.clone();
        let _rx = bus.subscribe();
        assert_eq!(clone.subscriber_count(), 1);
    }
}
