//! Decoupled multi-consumer fan-out of forward lifecycle events.
//!
//! Grounded on the teacher's use of channel-based fan-out for
//! supervisor-style signalling (`kube/proxy_recovery.rs`'s
//! `tokio::sync::broadcast` signal channel), generalized here into two
//! delivery modes: synchronous handlers that run inline on the publisher's
//! task (for fast observers like a status aggregator), and bounded
//! per-subscriber async queues that drop events under backpressure rather
//! than block the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::config::ForwardId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ForwardStarting,
    ForwardActive,
    ForwardReconnecting,
    ForwardDisabled,
    ForwardRemoved,
    HealthDegraded,
    HealthFailed,
    Stale,
    WorkerHung,
    Error,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub forward_id: ForwardId,
    pub kind: EventKind,
    pub fields: HashMap<String, String>,
}

impl Event {
    pub fn new(forward_id: ForwardId, kind: EventKind) -> Self {
        Self {
            forward_id,
            kind,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

pub type SyncHandler = Arc<dyn Fn(&Event) + Send + Sync>;

struct AsyncSubscriber {
    kinds: Option<Vec<EventKind>>,
    tx: mpsc::Sender<Event>,
}

impl AsyncSubscriber {
    fn wants(&self, kind: EventKind) -> bool {
        match &self.kinds {
            None => true,
            Some(kinds) => kinds.contains(&kind),
        }
    }
}

const DEFAULT_QUEUE_DEPTH: usize = 64;

/// A closed bus silently discards subsequent publishes and subscriptions;
/// close is idempotent.
pub struct EventBus {
    closed: AtomicBool,
    sync_handlers: RwLock<Vec<SyncHandler>>,
    async_subs: RwLock<Vec<AsyncSubscriber>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            sync_handlers: RwLock::new(Vec::new()),
            async_subs: RwLock::new(Vec::new()),
        }
    }

    pub async fn subscribe_sync(&self, handler: SyncHandler) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.sync_handlers.write().await.push(handler);
    }

    /// Subscribe to every event kind.
    pub async fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        self.subscribe_filtered(None).await
    }

    /// Subscribe to a specific set of event kinds.
    pub async fn subscribe_by_kind(&self, kinds: Vec<EventKind>) -> mpsc::Receiver<Event> {
        self.subscribe_filtered(Some(kinds)).await
    }

    async fn subscribe_filtered(&self, kinds: Option<Vec<EventKind>>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_DEPTH);
        if !self.closed.load(Ordering::Acquire) {
            self.async_subs.write().await.push(AsyncSubscriber { kinds, tx });
        }
        rx
    }

    /// Publish an event: synchronous handlers run inline, then each
    /// matching async subscriber gets a non-blocking `try_send` — a full
    /// queue drops the event and logs a warning rather than stalling the
    /// publisher.
    pub async fn publish(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        for handler in self.sync_handlers.read().await.iter() {
            handler(&event);
        }

        let subs = self.async_subs.read().await;
        for sub in subs.iter() {
            if !sub.wants(event.kind) {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event.clone()) {
                warn!(
                    forward_id = %event.forward_id,
                    ?event.kind,
                    "event bus subscriber queue full, dropping event"
                );
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(s: &str) -> ForwardId {
        crate::config::testing::forward_id(s)
    }

    #[tokio::test]
    async fn synchronous_handlers_run_inline() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        bus.subscribe_sync(Arc::new(move |e: &Event| {
            seen2.lock().unwrap().push(e.kind);
        }))
        .await;

        bus.publish(Event::new(fid("a:1"), EventKind::ForwardActive)).await;
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::ForwardActive]);
    }

    #[tokio::test]
    async fn subscribe_by_kind_filters() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_by_kind(vec![EventKind::Stale]).await;

        bus.publish(Event::new(fid("a:1"), EventKind::ForwardActive)).await;
        bus.publish(Event::new(fid("a:1"), EventKind::Stale)).await;

        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, EventKind::Stale);
    }

    #[tokio::test]
    async fn closed_bus_discards_publishes_and_subscriptions() {
        let bus = EventBus::new();
        bus.close();
        let mut rx = bus.subscribe_all().await;
        bus.publish(Event::new(fid("a:1"), EventKind::ForwardActive)).await;
        // Subscription after close yields a receiver that will never see anything.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_without_blocking_publisher() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all().await;
        for _ in 0..(DEFAULT_QUEUE_DEPTH + 5) {
            bus.publish(Event::new(fid("a:1"), EventKind::ForwardActive)).await;
        }
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, DEFAULT_QUEUE_DEPTH);
    }
}
