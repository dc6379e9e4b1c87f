//! Buffered traffic capture pipeline.
//!
//! `capture()` is the only synchronization point between the request path
//! and slow I/O: it enqueues into a bounded channel and never blocks. A
//! full buffer drops the new event with a warning. One background worker
//! drains the channel and spawns two independent tasks per event, so a
//! slow persistence write never delays live broadcast and vice versa.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::repository::TrafficRepository;
use crate::traffic::broadcaster::TrafficBroadcaster;
use crate::traffic::types::TrafficEvent;

pub struct TrafficPipeline {
    sender: Mutex<Option<mpsc::Sender<TrafficEvent>>>,
    dropped: AtomicU64,
}

impl TrafficPipeline {
    /// Spawns the drain worker and returns the capture handle.
    pub fn start(
        repository: Arc<dyn TrafficRepository>,
        broadcaster: Arc<TrafficBroadcaster>,
        capacity: usize,
    ) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::channel::<TrafficEvent>(capacity);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let persist_repo = Arc::clone(&repository);
                let persist_event = event.clone();
                tokio::spawn(async move {
                    if !persist_repo.save(&persist_event) {
                        warn!(
                            event_id = %persist_event.id,
                            session_id = %persist_event.session_id,
                            "failed to persist traffic event"
                        );
                    }
                });
                let fanout = Arc::clone(&broadcaster);
                tokio::spawn(async move {
                    let delivered = fanout.broadcast(&event);
                    debug!(event_id = %event.id, delivered, "traffic event broadcast");
                });
            }
            debug!("traffic pipeline drained");
        });
        Arc::new(Self::with_sender(sender))
    }

    fn with_sender(sender: mpsc::Sender<TrafficEvent>) -> Self {
        TrafficPipeline {
            sender: Mutex::new(Some(sender)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. Correctness of request serving never depends
    /// on this succeeding.
    pub fn capture(&self, event: TrafficEvent) {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            warn!(event_id = %event.id, "traffic pipeline closed, event discarded");
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %event.id,
                    session_id = %event.session_id,
                    "capture buffer full, dropping traffic event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                warn!(event_id = %event.id, "traffic worker stopped, event discarded");
            }
        }
    }

    /// Stops accepting new events; the worker exits once the buffer drains.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Events rejected because the buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::repository::{InMemoryTrafficRepository, TrafficRepository};

    fn event(id: &str) -> TrafficEvent {
        TrafficEvent {
            id: id.to_string(),
            session_id: "s1".to_string(),
            timestamp: 0,
            method: "GET".to_string(),
            path: "/x".to_string(),
            query: HashMap::new(),
            request_headers: HashMap::new(),
            request_body: None,
            response_status: 200,
            response_headers: HashMap::new(),
            response_body: None,
            stubbed: false,
            matched_stub_id: None,
            duration_ms: 1,
            target_service: None,
        }
    }

    #[tokio::test]
    async fn captured_events_reach_persistence_and_subscribers() {
        let repository = Arc::new(InMemoryTrafficRepository::new());
        let broadcaster = Arc::new(TrafficBroadcaster::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broadcaster.subscribe(
            "c1",
            Box::new(move |payload| {
                sink.lock().push(payload.to_string());
                Ok(())
            }),
        );
        let pipeline = TrafficPipeline::start(
            Arc::clone(&repository) as Arc<dyn TrafficRepository>,
            Arc::clone(&broadcaster),
            16,
        );

        pipeline.capture(event("e1"));
        pipeline.capture(event("e2"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(repository.get("e1").is_some());
        assert!(repository.get("e2").is_some());
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(pipeline.dropped_events(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_never_stops_the_broadcast() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct RefusingRepository {
            attempts: AtomicUsize,
        }

        impl TrafficRepository for RefusingRepository {
            fn save(&self, _event: &TrafficEvent) -> bool {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                false
            }

            fn get(&self, _event_id: &str) -> Option<TrafficEvent> {
                None
            }

            fn list_by_session(&self, _session_id: &str, _limit: usize) -> Vec<TrafficEvent> {
                Vec::new()
            }

            fn clear(&self) -> usize {
                0
            }
        }

        let repository = Arc::new(RefusingRepository {
            attempts: AtomicUsize::new(0),
        });
        let broadcaster = Arc::new(TrafficBroadcaster::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broadcaster.subscribe(
            "c1",
            Box::new(move |payload| {
                sink.lock().push(payload.to_string());
                Ok(())
            }),
        );
        let pipeline = TrafficPipeline::start(
            Arc::clone(&repository) as Arc<dyn TrafficRepository>,
            Arc::clone(&broadcaster),
            16,
        );

        pipeline.capture(event("e1"));
        pipeline.capture(event("e2"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(repository.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(pipeline.dropped_events(), 0);
    }

    #[tokio::test]
    async fn full_buffer_drops_the_newest_event() {
        // No worker draining, so the buffer genuinely fills.
        let (sender, _receiver) = mpsc::channel(1);
        let pipeline = TrafficPipeline::with_sender(sender);

        pipeline.capture(event("kept"));
        pipeline.capture(event("dropped-1"));
        pipeline.capture(event("dropped-2"));

        assert_eq!(pipeline.dropped_events(), 2);
    }

    #[tokio::test]
    async fn close_discards_later_events_without_panic() {
        let repository = Arc::new(InMemoryTrafficRepository::new());
        let broadcaster = Arc::new(TrafficBroadcaster::new());
        let pipeline = TrafficPipeline::start(
            Arc::clone(&repository) as Arc<dyn TrafficRepository>,
            broadcaster,
            4,
        );

        pipeline.capture(event("before"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.close();
        pipeline.capture(event("after"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(repository.get("before").is_some());
        assert!(repository.get("after").is_none());
        assert_eq!(pipeline.dropped_events(), 0);
    }
}
