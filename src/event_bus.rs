// =============================================================================
// Event Bus
// =============================================================================
//
// Fan-out point for every [`EventEnvelope`] the engine publishes. Subscribers
// register a bounded queue and an optional topic filter; each subscriber's
// queue preserves FIFO order (per topic, since all topics share one queue
// per subscriber), but there is no ordering guarantee *across* subscribers or
// across topics delivered to different subscribers.
//
// Each subscriber owns an independent queue and overflow policy rather than
// sharing one downstream sink, since nothing in `tokio::sync::mpsc` lets a
// producer evict an already-queued item, which `drop_oldest` requires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::types::{Event, EventEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room (the default).
    DropOldest,
    /// Discard the new event, keeping the queue's current contents.
    DropNew,
    /// Make the publisher wait until the subscriber drains space.
    BlockPublisher,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

/// Returns the topic name for an event, used by [`EventBus::subscribe_topics`]
/// to build a filter without subscribers needing to match on [`Event`]
/// themselves.
pub fn topic_of(event: &Event) -> &'static str {
    match event {
        Event::BarFetched { .. } => "bar_fetched",
        Event::BarRejected { .. } => "bar_rejected",
        Event::SignalGenerated { .. } => "signal_generated",
        Event::RiskRejected { .. } => "risk_rejected",
        Event::OrderSubmitted { .. } => "order_submitted",
        Event::OrderFilled { .. } => "order_filled",
        Event::OrderFailed { .. } => "order_failed",
        Event::PositionOpened { .. } => "position_opened",
        Event::PositionClosed { .. } => "position_closed",
        Event::StopTriggered { .. } => "stop_triggered",
        Event::TakeProfitTriggered { .. } => "take_profit_triggered",
        Event::TrailingAdjusted { .. } => "trailing_adjusted",
        Event::HeartbeatTick { .. } => "heartbeat_tick",
        Event::EngineStarted => "engine_started",
        Event::EngineStopped => "engine_stopped",
        Event::EngineFault { .. } => "engine_fault",
    }
}

type Filter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct SubscriberQueue {
    buffer: Mutex<VecDeque<EventEnvelope>>,
    capacity: usize,
    policy: OverflowPolicy,
    has_data: Notify,
    has_space: Notify,
    overflow_count: AtomicU64,
    filter: Option<Filter>,
}

/// A live subscription; drop it (or let it go out of scope) to unsubscribe —
/// the bus prunes dead subscribers lazily on next publish.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub async fn recv(&self) -> EventEnvelope {
        loop {
            if let Some(envelope) = self.queue.buffer.lock().pop_front() {
                self.queue.has_space.notify_one();
                return envelope;
            }
            self.queue.has_data.notified().await;
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.queue.overflow_count.load(Ordering::Relaxed)
    }
}

pub struct EventBus {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    pub fn subscribe(&self, capacity: usize, policy: OverflowPolicy) -> Subscription {
        self.subscribe_filtered(capacity, policy, None)
    }

    /// Subscribe to only the named topics (see [`topic_of`]).
    pub fn subscribe_topics(
        &self,
        capacity: usize,
        policy: OverflowPolicy,
        topics: Vec<&'static str>,
    ) -> Subscription {
        let filter: Filter = Box::new(move |event| topics.contains(&topic_of(event)));
        self.subscribe_filtered(capacity, policy, Some(filter))
    }

    fn subscribe_filtered(&self, capacity: usize, policy: OverflowPolicy, filter: Option<Filter>) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            policy,
            has_data: Notify::new(),
            has_space: Notify::new(),
            overflow_count: AtomicU64::new(0),
            filter,
        });
        self.subscribers.lock().push(queue.clone());
        Subscription { queue }
    }

    /// Deliver `envelope` to every matching subscriber per its own overflow
    /// policy. Dead subscribers (no other strong reference left) are dropped
    /// from the registry as a side effect.
    pub async fn publish(&self, envelope: EventEnvelope) {
        let subscribers: Vec<Arc<SubscriberQueue>> = {
            let mut guard = self.subscribers.lock();
            guard.retain(|q| Arc::strong_count(q) > 1);
            guard.clone()
        };

        for queue in subscribers {
            if let Some(filter) = &queue.filter {
                if !filter(&envelope.event) {
                    continue;
                }
            }
            Self::deliver(&queue, envelope.clone()).await;
        }
    }

    async fn deliver(queue: &Arc<SubscriberQueue>, envelope: EventEnvelope) {
        loop {
            {
                let mut buffer = queue.buffer.lock();
                if buffer.len() < queue.capacity {
                    buffer.push_back(envelope);
                    queue.has_data.notify_one();
                    return;
                }
                match queue.policy {
                    OverflowPolicy::DropOldest => {
                        buffer.pop_front();
                        buffer.push_back(envelope);
                        queue.overflow_count.fetch_add(1, Ordering::Relaxed);
                        queue.has_data.notify_one();
                        return;
                    }
                    OverflowPolicy::DropNew => {
                        queue.overflow_count.fetch_add(1, Ordering::Relaxed);
                        warn!("event bus subscriber queue full, dropping new event");
                        return;
                    }
                    OverflowPolicy::BlockPublisher => {
                        // fall through to wait below, buffer lock released at
                        // end of this block
                    }
                }
            }
            queue.has_space.notified().await;
        }
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
    use crate::types::Event;

    fn envelope(n: usize) -> EventEnvelope {
        EventEnvelope::new(None, format!("corr-{n}"), Event::HeartbeatTick { summary: n.to_string() })
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe(8, OverflowPolicy::DropOldest);
        bus.publish(envelope(1)).await;
        bus.publish(envelope(2)).await;

        let first = sub.recv().await;
        let second = sub.recv().await;
        assert_eq!(first.correlation_id, "corr-1");
        assert_eq!(second.correlation_id, "corr-2");
    }

    #[tokio::test]
    async fn drop_oldest_evicts_the_front_of_a_full_queue() {
        let bus = EventBus::new();
        let sub = bus.subscribe(2, OverflowPolicy::DropOldest);
        bus.publish(envelope(1)).await;
        bus.publish(envelope(2)).await;
        bus.publish(envelope(3)).await; // evicts corr-1

        let first = sub.recv().await;
        assert_eq!(first.correlation_id, "corr-2");
        assert_eq!(sub.overflow_count(), 1);
    }

    #[tokio::test]
    async fn drop_new_discards_the_incoming_event() {
        let bus = EventBus::new();
        let sub = bus.subscribe(2, OverflowPolicy::DropNew);
        bus.publish(envelope(1)).await;
        bus.publish(envelope(2)).await;
        bus.publish(envelope(3)).await; // discarded

        let first = sub.recv().await;
        let second = sub.recv().await;
        assert_eq!(first.correlation_id, "corr-1");
        assert_eq!(second.correlation_id, "corr-2");
        assert_eq!(sub.overflow_count(), 1);
    }

    #[tokio::test]
    async fn topic_filter_only_admits_matching_events() {
        let bus = EventBus::new();
        let sub = bus.subscribe_topics(8, OverflowPolicy::DropOldest, vec!["order_failed"]);
        bus.publish(envelope(1)).await; // heartbeat, filtered out
        bus.publish(EventEnvelope::new(
            Some("XRPUSDT".to_string()),
            "corr-x",
            Event::OrderFailed { reason: "timeout".to_string() },
        ))
        .await;

        let received = sub.recv().await;
        assert_eq!(received.correlation_id, "corr-x");
    }

    #[tokio::test]
    async fn block_publisher_waits_for_space() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(1, OverflowPolicy::BlockPublisher);
        bus.publish(envelope(1)).await;

        let bus_clone = bus.clone();
        let publisher = tokio::spawn(async move {
            bus_clone.publish(envelope(2)).await;
        });

        // Give the blocked publisher a moment to actually be waiting, then
        // drain the queue to unblock it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let first = sub.recv().await;
        assert_eq!(first.correlation_id, "corr-1");

        publisher.await.unwrap();
        let second = sub.recv().await;
        assert_eq!(second.correlation_id, "corr-2");
    }

    #[test]
    fn dropped_subscription_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe(4, OverflowPolicy::DropOldest);
            assert_eq!(bus.subscribers.lock().len(), 1);
        }
        assert_eq!(bus.subscribers.lock().len(), 1); // not pruned until publish
    }
}
