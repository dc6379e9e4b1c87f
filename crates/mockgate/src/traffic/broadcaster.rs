//! Live traffic fan-out to subscriber connections.
//!
//! The broadcaster keeps two maps keyed by connection id: the delivery
//! callback handed over at subscribe time, and an optional session filter.
//! It performs no session validation itself; the transport layer vets a
//! filter target before calling `set_filter` and closes the connection on
//! its own terms. A failed delivery is logged and the subscriber stays
//! registered until it explicitly unsubscribes.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::traffic::types::TrafficEvent;

#[derive(Debug, Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Callback invoked with the serialized event for one subscriber.
pub type DeliveryFn = Box<dyn Fn(&str) -> Result<(), DeliveryError> + Send + Sync>;

#[derive(Default)]
pub struct TrafficBroadcaster {
    connections: RwLock<HashMap<String, DeliveryFn>>,
    filters: RwLock<HashMap<String, String>>,
}

impl TrafficBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection. New subscribers start unfiltered and
    /// receive every session's traffic.
    pub fn subscribe(&self, connection_id: &str, deliver: DeliveryFn) {
        self.connections
            .write()
            .insert(connection_id.to_string(), deliver);
        self.filters.write().remove(connection_id);
        debug!(connection_id, "traffic subscriber registered");
    }

    /// Narrows the subscriber to one session, or clears the filter with
    /// `None`.
    pub fn set_filter(&self, connection_id: &str, session_id: Option<&str>) {
        let mut filters = self.filters.write();
        match session_id {
            Some(session_id) => {
                filters.insert(connection_id.to_string(), session_id.to_string());
            }
            None => {
                filters.remove(connection_id);
            }
        }
    }

    pub fn unsubscribe(&self, connection_id: &str) {
        self.connections.write().remove(connection_id);
        self.filters.write().remove(connection_id);
        debug!(connection_id, "traffic subscriber removed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Delivers the event to every connection whose filter is absent or
    /// equal to the event's session. Returns how many deliveries succeeded.
    pub fn broadcast(&self, event: &TrafficEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "failed to serialize traffic event");
                return 0;
            }
        };
        let filters = self.filters.read();
        let connections = self.connections.read();
        let mut delivered = 0;
        for (connection_id, deliver) in connections.iter() {
            if let Some(filter) = filters.get(connection_id) {
                if *filter != event.session_id {
                    continue;
                }
            }
            match deliver(&payload) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(connection_id, error = %err, "traffic delivery failed");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn event(session: &str) -> TrafficEvent {
        TrafficEvent {
            id: "e1".to_string(),
            session_id: session.to_string(),
            timestamp: 0,
            method: "GET".to_string(),
            path: "/x".to_string(),
            query: HashMap::new(),
            request_headers: HashMap::new(),
            request_body: None,
            response_status: 200,
            response_headers: HashMap::new(),
            response_body: None,
            stubbed: true,
            matched_stub_id: None,
            duration_ms: 1,
            target_service: None,
        }
    }

    fn collecting(sink: Arc<Mutex<Vec<String>>>) -> DeliveryFn {
        Box::new(move |payload| {
            sink.lock().unwrap().push(payload.to_string());
            Ok(())
        })
    }

    #[test]
    fn unfiltered_subscribers_see_everything() {
        let broadcaster = TrafficBroadcaster::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        broadcaster.subscribe("c1", collecting(Arc::clone(&sink)));

        assert_eq!(broadcaster.broadcast(&event("s1")), 1);
        assert_eq!(broadcaster.broadcast(&event("s2")), 1);
        assert_eq!(sink.lock().unwrap().len(), 2);
    }

    #[test]
    fn filters_scope_delivery_to_one_session() {
        let broadcaster = TrafficBroadcaster::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        broadcaster.subscribe("c1", collecting(Arc::clone(&sink)));
        broadcaster.set_filter("c1", Some("s1"));

        assert_eq!(broadcaster.broadcast(&event("s2")), 0);
        assert_eq!(broadcaster.broadcast(&event("s1")), 1);

        broadcaster.set_filter("c1", None);
        assert_eq!(broadcaster.broadcast(&event("s2")), 1);

        let payloads = sink.lock().unwrap();
        assert!(payloads[0].contains("\"sessionId\":\"s1\""));
    }

    #[test]
    fn failed_delivery_keeps_the_subscriber() {
        let broadcaster = TrafficBroadcaster::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        broadcaster.subscribe(
            "flaky",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DeliveryError("socket gone".to_string()))
            }),
        );

        assert_eq!(broadcaster.broadcast(&event("s1")), 0);
        assert_eq!(broadcaster.broadcast(&event("s1")), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.unsubscribe("flaky");
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn resubscribing_clears_a_stale_filter() {
        let broadcaster = TrafficBroadcaster::new();
        let sink = Arc::new(Mutex::new(Vec::new()));
        broadcaster.subscribe("c1", collecting(Arc::clone(&sink)));
        broadcaster.set_filter("c1", Some("s1"));
        broadcaster.subscribe("c1", collecting(Arc::clone(&sink)));

        assert_eq!(broadcaster.broadcast(&event("s2")), 1);
    }
}
