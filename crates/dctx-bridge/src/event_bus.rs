//! The Event Bus (§4.5): validated, priority-aware fan-out of lifecycle
//! events to every subscriber.
//!
//! Each subscriber owns a bounded queue instead of an unbounded flume
//! channel: a slow reader must not grow memory without bound, so when a
//! subscriber's queue is full the bus drops the oldest `low`-priority
//! message first, then `medium`, recording the drop. Within a single
//! `(source_system, event_type)` stream, events carrying
//! `routing.expected_sequence` are held back until the gap in front of
//! them closes, so a subscriber never observes that stream out of order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;

use dctx_core::types::{Event, EventPriority};

use crate::protocol::BridgeMessage;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event type `{event_type}` may only be published by `{required}`, got `{actual}`")]
    UnauthorizedEmitter {
        event_type: String,
        required: String,
        actual: String,
    },
}

type StreamKey = (String, String);

struct SubscriberQueue {
    capacity: usize,
    messages: Mutex<VecDeque<(EventPriority, BridgeMessage)>>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enqueue `msg`, applying the priority-drop policy if full. Returns
    /// `true` if the message was enqueued, `false` if it was dropped.
    fn push(&self, priority: EventPriority, msg: BridgeMessage) -> bool {
        let mut q = self.messages.lock().expect("subscriber queue poisoned");
        if q.len() >= self.capacity {
            let make_room = q
                .iter()
                .position(|(p, _)| *p == EventPriority::Low)
                .or_else(|| q.iter().position(|(p, _)| *p == EventPriority::Medium));
            match make_room {
                Some(idx) => {
                    q.remove(idx);
                }
                None => return false,
            }
        }
        q.push_back((priority, msg));
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<BridgeMessage> {
        self.messages
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
            .map(|(_, msg)| msg)
    }
}

/// The receiving half handed back by [`EventBus::subscribe`].
pub struct Receiver {
    queue: Arc<SubscriberQueue>,
}

impl Receiver {
    pub async fn recv(&self) -> BridgeMessage {
        loop {
            if let Some(msg) = self.queue.pop() {
                return msg;
            }
            self.queue.notify.notified().await;
        }
    }
}

/// Per-stream reorder buffer for `routing.expected_sequence` (§4.5).
#[derive(Default)]
struct Sequencer {
    next_expected: DashMap<StreamKey, u64>,
    pending: DashMap<StreamKey, BTreeMap<u64, Event>>,
}

impl Sequencer {
    /// Feed one event through the sequencer for its stream, returning
    /// every event now ready for delivery in order (possibly more than
    /// one, if this event closed a gap).
    fn admit(&self, event: Event) -> Vec<Event> {
        let Some(seq) = event.routing.expected_sequence else {
            return vec![event];
        };
        let key = (event.source_system.clone(), event.event_type().to_string());
        let expected = *self.next_expected.entry(key.clone()).or_insert(seq);

        if seq < expected {
            return Vec::new(); // stale duplicate
        }
        if seq > expected {
            self.pending.entry(key).or_default().insert(seq, event);
            return Vec::new();
        }

        let mut ready = vec![event];
        let mut next = expected + 1;
        if let Some(mut buffered) = self.pending.get_mut(&key) {
            while let Some(e) = buffered.remove(&next) {
                ready.push(e);
                next += 1;
            }
        }
        self.next_expected.insert(key, next);
        ready
    }
}

/// A bounded, priority-dropping, sequence-aware fan-out bus.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<SubscriberQueue>>>>,
    sequencer: Arc<Sequencer>,
    dropped: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            sequencer: Arc::new(Sequencer::default()),
            dropped: Arc::new(AtomicU64::new(0)),
            queue_capacity,
        }
    }

    pub fn subscribe(&self) -> Receiver {
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        self.subscribers.lock().expect("subscriber list poisoned").push(queue.clone());
        Receiver { queue }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber list poisoned").len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Validate authority, admit through the per-stream sequencer, and
    /// fan out to every subscriber.
    pub fn publish(&self, event: Event) -> Result<(), EventBusError> {
        if let Some(required) = event.data.required_source() {
            if event.source_system != required {
                return Err(EventBusError::UnauthorizedEmitter {
                    event_type: event.event_type().to_string(),
                    required: required.to_string(),
                    actual: event.source_system.clone(),
                });
            }
        }

        for ready in self.sequencer.admit(event) {
            let priority = ready.priority;
            let msg = BridgeMessage::from(ready);
            let subscribers = self.subscribers.lock().expect("subscriber list poisoned").clone();
            for sub in subscribers {
                if !sub.push(priority, msg.clone()) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dctx_core::types::{EventData, RoutingMetadata};

    fn event(source: &str, data: EventData, priority: EventPriority) -> Event {
        Event::new(source, data, priority)
    }

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers() {
        let bus = EventBus::new();
        let r1 = bus.subscribe();
        let r2 = bus.subscribe();
        bus.publish(event("session-store", EventData::SessionStarted, EventPriority::Medium)).unwrap();

        assert!(matches!(r1.recv().await, BridgeMessage::Domain(_)));
        assert!(matches!(r2.recv().await, BridgeMessage::Domain(_)));
    }

    #[test]
    fn authority_matrix_rejects_unauthorized_emitter() {
        let bus = EventBus::new();
        let result = bus.publish(event(
            "rogue-system",
            EventData::TaskCreated { progress_id: 1 },
            EventPriority::High,
        ));
        assert!(matches!(result, Err(EventBusError::UnauthorizedEmitter { .. })));
    }

    #[test]
    fn authority_matrix_allows_authorized_emitter() {
        let bus = EventBus::new();
        let result = bus.publish(event(
            "task-planning",
            EventData::TaskCreated { progress_id: 1 },
            EventPriority::High,
        ));
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn full_queue_drops_low_priority_first() {
        let bus = EventBus::with_capacity(2);
        let r = bus.subscribe();

        bus.publish(event("x", EventData::SessionStarted, EventPriority::Low)).unwrap();
        bus.publish(event("x", EventData::SessionEnded, EventPriority::Critical)).unwrap();
        bus.publish(event("x", EventData::BreakStarted, EventPriority::High)).unwrap();

        assert_eq!(bus.dropped_count(), 0); // low was evicted to make room, not dropped outright

        let first = r.recv().await;
        let second = r.recv().await;
        let BridgeMessage::Domain(e1) = first else { panic!() };
        let BridgeMessage::Domain(e2) = second else { panic!() };
        assert_eq!(e1.event_type(), "session_ended");
        assert_eq!(e2.event_type(), "break_started");
    }

    #[tokio::test]
    async fn out_of_order_sequence_is_held_until_gap_closes() {
        let bus = EventBus::new();
        let r = bus.subscribe();

        let mut e0 = event("code-navigation", EventData::CodeChanged { paths: vec!["a".into()] }, EventPriority::Medium);
        e0.routing = RoutingMetadata { broadcast: true, requires_ack: false, expected_sequence: Some(0) };
        let mut e2 = event("code-navigation", EventData::CodeChanged { paths: vec!["c".into()] }, EventPriority::Medium);
        e2.routing = RoutingMetadata { broadcast: true, requires_ack: false, expected_sequence: Some(2) };
        let mut e1 = event("code-navigation", EventData::CodeChanged { paths: vec!["b".into()] }, EventPriority::Medium);
        e1.routing = RoutingMetadata { broadcast: true, requires_ack: false, expected_sequence: Some(1) };

        bus.publish(e0).unwrap();
        bus.publish(e2).unwrap(); // arrives early, must be buffered
        assert_eq!(bus.subscriber_count(), 1);

        let first = r.recv().await;
        let BridgeMessage::Domain(first) = first else { panic!() };
        assert_eq!(first.event_type(), "code_changed");

        bus.publish(e1).unwrap(); // closes the gap, releases seq 1 then seq 2
        let second = r.recv().await;
        let third = r.recv().await;
        let (BridgeMessage::Domain(second), BridgeMessage::Domain(third)) = (second, third) else { panic!() };
        assert_eq!(second.routing.expected_sequence, Some(1));
        assert_eq!(third.routing.expected_sequence, Some(2));
    }
}
