//! Event bus for kernel observability.
//!
//! Every kernel component announces its state changes here. The bus is a
//! typed pub/sub channel with a bounded replay ring:
//!   - **emit**: stamp an immutable [`Event`] with a per-bus monotonic id,
//!     push it into the replay ring and fan it out to live subscribers
//!   - **subscribe**: live events matching an [`EventFilter`]
//!   - **subscribe_with_replay**: the ring's matching backlog first, then live
//!   - **wait_for**: the first matching future event, with optional timeout
//!
//! Nothing is persisted beyond the in-memory ring.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::types::{Error, Result};

// =============================================================================
// Message Types
// =============================================================================

/// Kinds of kernel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Scheduler
    TaskScheduled,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    // Circuit breaker
    ContextCreated,
    ContextReleased,
    ContextRefused,
    CircuitStateChanged,
    // Approval gate
    ApprovalRequested,
    ApprovalAutoApproved,
    ApprovalResolved,
    ApprovalTimedOut,
    // Resource monitor
    AgentStarted,
    AgentStopped,
    AgentStuck,
    AgentKilled,
    // Router
    RouteDecided,
    RouteCompleted,
    RouteFailed,
    BackendFailed,
    /// Free-form events from callers outside the kernel.
    Custom,
}

/// Immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: u64,
    pub event_type: EventType,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Optional fields for [`EventBus::emit_with`].
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub correlation_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EmitOptions {
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            metadata: HashMap::new(),
        }
    }
}

// =============================================================================
// Filtering
// =============================================================================

/// Subscription filter. Empty sets match anything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: HashSet<EventType>,
    pub sources: HashSet<String>,
    pub correlation_id: Option<String>,
}

impl EventFilter {
    /// Filter that accepts every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            event_types: types.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.insert(source.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&event.source) {
            return false;
        }
        if let Some(ref wanted) = self.correlation_id {
            if event.correlation_id.as_ref() != Some(wanted) {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Replay ring and broadcast channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Events retained for `subscribe_with_replay` (oldest dropped first).
    pub replay_capacity: usize,
    /// Live channel capacity; slow subscribers beyond this lag.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 100,
            channel_capacity: 1024,
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving side of a filtered subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<Event>>,
    filter: EventFilter,
    backlog: VecDeque<Arc<Event>>,
}

impl Subscription {
    /// Next matching event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event_subscriber_lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event_subscriber_lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Adapt into a `Stream` of matching events.
    pub fn into_stream(self) -> impl Stream<Item = Arc<Event>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

// =============================================================================
// EventBus
// =============================================================================

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusStats {
    pub events_emitted: u64,
    pub replay_len: usize,
    pub active_subscribers: usize,
}

#[derive(Debug)]
struct BusState {
    next_id: u64,
    replay: VecDeque<Arc<Event>>,
}

#[derive(Debug)]
struct BusInner {
    sender: broadcast::Sender<Arc<Event>>,
    state: Mutex<BusState>,
    replay_capacity: usize,
}

/// In-memory event bus. Cheap to clone; clones share one ring and channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                state: Mutex::new(BusState {
                    next_id: 1,
                    replay: VecDeque::with_capacity(config.replay_capacity),
                }),
                replay_capacity: config.replay_capacity,
            }),
        }
    }

    /// Emit an event; returns its id.
    pub fn emit(
        &self,
        event_type: EventType,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> u64 {
        self.emit_with(event_type, source, payload, EmitOptions::default())
    }

    /// Emit with correlation id and/or metadata.
    pub fn emit_with(
        &self,
        event_type: EventType,
        source: impl Into<String>,
        payload: serde_json::Value,
        opts: EmitOptions,
    ) -> u64 {
        // Ring push and broadcast happen under one lock so replay subscribers
        // never see an event twice or miss one.
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;

        let event = Arc::new(Event {
            id,
            event_type,
            source: source.into(),
            timestamp: Utc::now(),
            payload,
            correlation_id: opts.correlation_id,
            metadata: opts.metadata,
        });

        if self.inner.replay_capacity > 0 {
            if state.replay.len() >= self.inner.replay_capacity {
                state.replay.pop_front();
            }
            state.replay.push_back(event.clone());
        }

        let delivered = self.inner.sender.send(event.clone()).unwrap_or(0);
        tracing::trace!(
            event_id = id,
            event_type = ?event.event_type,
            source = %event.source,
            delivered,
            "event_emitted"
        );
        id
    }

    /// Live subscription; sees only events emitted after this call.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
            filter,
            backlog: VecDeque::new(),
        }
    }

    /// Subscription that first replays the matching part of the ring.
    pub fn subscribe_with_replay(&self, filter: EventFilter) -> Subscription {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = self.inner.sender.subscribe();
        let backlog = state
            .replay
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        Subscription {
            receiver,
            filter,
            backlog,
        }
    }

    /// Resolve with the first matching event emitted after this call.
    ///
    /// The subscription is taken eagerly, so an event emitted between this
    /// call and the first poll of the returned future is not missed.
    pub fn wait_for(
        &self,
        filter: EventFilter,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Arc<Event>>> + Send + 'static {
        let mut sub = self.subscribe(filter);
        async move {
            let next = match timeout {
                Some(limit) => tokio::time::timeout(limit, sub.recv()).await.map_err(|_| {
                    Error::timeout(format!("no matching event within {}ms", limit.as_millis()))
                })?,
                None => sub.recv().await,
            };
            next.ok_or_else(|| Error::internal("event bus closed"))
        }
    }

    /// Copy of the replay ring, oldest first.
    pub fn replay_snapshot(&self) -> Vec<Arc<Event>> {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.replay.iter().cloned().collect()
    }

    /// Current bus statistics.
    pub fn stats(&self) -> BusStats {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        BusStats {
            events_emitted: state.next_id - 1,
            replay_len: state.replay.len(),
            active_subscribers: self.inner.sender.receiver_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn small_bus(replay: usize) -> EventBus {
        EventBus::new(EventBusConfig {
            replay_capacity: replay,
            channel_capacity: 64,
        })
    }

    #[test]
    fn test_ids_are_monotonic() {
        let bus = EventBus::default();
        let a = bus.emit(EventType::Custom, "test", json!({}));
        let b = bus.emit(EventType::Custom, "test", json!({}));
        let c = bus.emit(EventType::TaskStarted, "scheduler", json!({}));
        assert!(a < b && b < c);
        assert_eq!(bus.stats().events_emitted, 3);
    }

    #[test]
    fn test_ring_fills_without_subscribers() {
        let bus = small_bus(3);
        for _ in 0..5 {
            bus.emit(EventType::Custom, "test", json!({}));
        }
        let ring = bus.replay_snapshot();
        assert_eq!(ring.len(), 3);
        // Oldest dropped first
        assert_eq!(ring[0].id, 3);
        assert_eq!(ring[2].id, 5);
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_type_and_source() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(
            EventFilter::of_types([EventType::TaskCompleted]).with_source("scheduler"),
        );

        bus.emit(EventType::TaskStarted, "scheduler", json!({}));
        bus.emit(EventType::TaskCompleted, "router", json!({}));
        let wanted = bus.emit(EventType::TaskCompleted, "scheduler", json!({"ok": true}));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, wanted);
        assert_eq!(received.payload["ok"], true);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_correlation() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(EventFilter::all().with_correlation("req-1"));

        bus.emit_with(EventType::Custom, "a", json!(1), EmitOptions::correlated("req-2"));
        bus.emit_with(EventType::Custom, "a", json!(2), EmitOptions::correlated("req-1"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.payload, json!(2));
    }

    #[tokio::test]
    async fn test_plain_subscribe_sees_no_history() {
        let bus = EventBus::default();
        bus.emit(EventType::Custom, "old", json!({}));
        let mut sub = bus.subscribe(EventFilter::all());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let bus = small_bus(2);
        bus.emit(EventType::Custom, "a", json!(1));
        bus.emit(EventType::Custom, "a", json!(2));
        bus.emit(EventType::Custom, "a", json!(3));

        let mut sub = bus.subscribe_with_replay(EventFilter::all());
        bus.emit(EventType::Custom, "a", json!(4));

        let seen: Vec<_> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.payload.clone())
        .collect();
        assert_eq!(seen, vec![json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_future_event() {
        let bus = EventBus::default();
        let waiter = bus.wait_for(
            EventFilter::of_types([EventType::AgentKilled]),
            Some(Duration::from_secs(1)),
        );
        bus.emit(EventType::AgentStarted, "monitor", json!({}));
        let id = bus.emit(EventType::AgentKilled, "monitor", json!({"agent": "a1"}));

        let event = waiter.await.unwrap();
        assert_eq!(event.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let bus = EventBus::default();
        let result = bus
            .wait_for(
                EventFilter::of_types([EventType::AgentKilled]),
                Some(Duration::from_millis(50)),
            )
            .await;
        assert_eq!(result.unwrap_err().code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let bus = EventBus::default();
        let stream = bus
            .subscribe(EventFilter::of_types([EventType::Custom]))
            .into_stream();
        bus.emit(EventType::Custom, "s", json!("x"));
        bus.emit(EventType::Custom, "s", json!("y"));

        let items: Vec<_> = stream.take(2).map(|e| e.payload.clone()).collect().await;
        assert_eq!(items, vec![json!("x"), json!("y")]);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());
        assert_eq!(bus.stats().active_subscribers, 1);
        drop(sub);
        assert_eq!(bus.stats().active_subscribers, 0);
    }
}
