//! Session progress sink

use oais_common::events::{EventBus, IngestEvent, SessionStep};

use crate::models::RequestType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotification {
    pub session_owner: String,
    pub session: String,
    pub step: SessionStep,
    pub request_type: RequestType,
    pub count: u32,
}

impl SessionNotification {
    pub fn new(
        session_owner: &str,
        session: &str,
        step: SessionStep,
        request_type: RequestType,
        count: u32,
    ) -> Self {
        Self {
            session_owner: session_owner.to_string(),
            session: session.to_string(),
            step,
            request_type,
            count,
        }
    }
}

/// Fire-and-forget progress reporting
pub trait SessionNotifier: Send + Sync {
    fn notify(&self, notification: SessionNotification);
}

/// Publishes progress as [`IngestEvent::SessionProgress`]
pub struct EventBusNotifier {
    event_bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

impl SessionNotifier for EventBusNotifier {
    fn notify(&self, notification: SessionNotification) {
        if notification.count == 0 {
            return;
        }
        self.event_bus.emit_lossy(IngestEvent::SessionProgress {
            session_owner: notification.session_owner,
            session: notification.session,
            step: notification.step,
            request_type: notification.request_type,
            count: notification.count,
            timestamp: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_goes_to_event_bus() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let notifier = EventBusNotifier::new(bus);

        notifier.notify(SessionNotification::new("o", "s", SessionStep::Granted, RequestType::Ingest, 0));
        notifier.notify(SessionNotification::new("o", "s", SessionStep::Denied, RequestType::Ingest, 2));

        match rx.recv().await.unwrap() {
            IngestEvent::SessionProgress { step, count, .. } => {
                assert_eq!(step, SessionStep::Denied);
                assert_eq!(count, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
