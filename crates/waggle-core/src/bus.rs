//! In-process message bus.
//!
//! Typed publish/subscribe with bounded history. Delivery is synchronous
//! with the publisher, but each handler runs behind `catch_unwind` so a
//! panicking subscriber cannot break later handlers or the publisher.
//! Specific-type handlers fire before wildcard handlers; within each class,
//! in subscription order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_MAX_HISTORY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.status_changed")]
    TaskStatusChanged,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "worker.spawned")]
    WorkerSpawned,
    #[serde(rename = "worker.completed")]
    WorkerCompleted,
    #[serde(rename = "worker.failed")]
    WorkerFailed,
    #[serde(rename = "worker.output")]
    WorkerOutput,
    #[serde(rename = "queen.decision")]
    QueenDecision,
    #[serde(rename = "queen.plan")]
    QueenPlan,
    #[serde(rename = "system.error")]
    SystemError,
    #[serde(rename = "blackboard.update")]
    BlackboardUpdate,
    #[serde(rename = "tool.executed")]
    ToolExecuted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "task.created",
            EventType::TaskStatusChanged => "task.status_changed",
            EventType::TaskAssigned => "task.assigned",
            EventType::WorkerSpawned => "worker.spawned",
            EventType::WorkerCompleted => "worker.completed",
            EventType::WorkerFailed => "worker.failed",
            EventType::WorkerOutput => "worker.output",
            EventType::QueenDecision => "queen.decision",
            EventType::QueenPlan => "queen.plan",
            EventType::SystemError => "system.error",
            EventType::BlackboardUpdate => "blackboard.update",
            EventType::ToolExecuted => "tool.executed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub payload: Value,
    pub time: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            task_id: None,
            worker_id: None,
            payload: Value::Null,
            time: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

pub type Handler = Arc<dyn Fn(&BusMessage) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<EventType, Vec<HandlerEntry>>,
    wildcard: Vec<HandlerEntry>,
    history: Vec<BusMessage>,
}

struct Inner {
    registry: Mutex<Registry>,
    max_history: usize,
    next_id: AtomicU64,
}

/// Handle returned by subscribe; dropping it does nothing, `unsubscribe` is
/// explicit and idempotent.
pub struct Subscription {
    id: u64,
    event_type: Option<EventType>,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut reg = inner.registry.lock().expect("bus lock poisoned");
        let entries = match self.event_type {
            Some(ty) => match reg.by_type.get_mut(&ty) {
                Some(v) => v,
                None => return,
            },
            None => &mut reg.wildcard,
        };
        entries.retain(|e| e.id != self.id);
    }
}

#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    pub fn new(max_history: usize) -> Self {
        let max_history = if max_history == 0 {
            DEFAULT_MAX_HISTORY
        } else {
            max_history
        };
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                max_history,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a handler for one event type.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.inner.registry.lock().expect("bus lock poisoned");
        reg.by_type.entry(event_type).or_default().push(HandlerEntry {
            id,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            event_type: Some(event_type),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register a handler that receives every event type.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BusMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.inner.registry.lock().expect("bus lock poisoned");
        reg.wildcard.push(HandlerEntry {
            id,
            handler: Arc::new(handler),
        });
        Subscription {
            id,
            event_type: None,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Publish a message: record it, then deliver to specific handlers
    /// followed by wildcard handlers. Handlers run outside the bus lock on a
    /// snapshot, so they may publish or subscribe reentrantly.
    pub fn publish(&self, msg: BusMessage) {
        let (specific, wildcard) = {
            let mut reg = self.inner.registry.lock().expect("bus lock poisoned");
            reg.history.push(msg.clone());
            if reg.history.len() > self.inner.max_history {
                let excess = reg.history.len() - self.inner.max_history;
                // drain shifts the survivors down, releasing the dropped
                // messages rather than leaving them live in spare capacity
                reg.history.drain(..excess);
            }
            let specific: Vec<Handler> = reg
                .by_type
                .get(&msg.event_type)
                .map(|v| v.iter().map(|e| Arc::clone(&e.handler)).collect())
                .unwrap_or_default();
            let wildcard: Vec<Handler> =
                reg.wildcard.iter().map(|e| Arc::clone(&e.handler)).collect();
            (specific, wildcard)
        };

        for handler in specific.iter().chain(wildcard.iter()) {
            if catch_unwind(AssertUnwindSafe(|| handler(&msg))).is_err() {
                tracing::error!(event_type = %msg.event_type, "bus handler panicked");
            }
        }
    }

    /// Last `n` messages in chronological order; `n == 0` returns everything.
    pub fn history(&self, n: usize) -> Vec<BusMessage> {
        let reg = self.inner.registry.lock().expect("bus lock poisoned");
        let len = reg.history.len();
        let n = if n == 0 || n > len { len } else { n };
        reg.history[len - n..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(ty: EventType) -> BusMessage {
        BusMessage::new(ty)
    }

    #[test]
    fn delivers_to_specific_subscriber() {
        let bus = MessageBus::new(100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = bus.subscribe(EventType::TaskCreated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(msg(EventType::TaskCreated));
        bus.publish(msg(EventType::WorkerSpawned));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_receives_everything() {
        let bus = MessageBus::new(100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = bus.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(msg(EventType::TaskCreated));
        bus.publish(msg(EventType::WorkerFailed));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn specific_handlers_fire_before_wildcard() {
        let bus = MessageBus::new(100);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let _w = bus.subscribe_all(move |_| o.lock().unwrap().push("wildcard"));
        let o = Arc::clone(&order);
        let _s = bus.subscribe(EventType::TaskCreated, move |_| {
            o.lock().unwrap().push("specific")
        });

        bus.publish(msg(EventType::TaskCreated));
        assert_eq!(*order.lock().unwrap(), vec!["specific", "wildcard"]);
    }

    #[test]
    fn panicking_handler_does_not_block_later_handlers() {
        let bus = MessageBus::new(100);
        let _bad = bus.subscribe(EventType::TaskCreated, |_| panic!("boom"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _good = bus.subscribe(EventType::TaskCreated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(msg(EventType::TaskCreated));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // history still recorded despite the panic
        assert_eq!(bus.history(0).len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = MessageBus::new(100);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = bus.subscribe(EventType::TaskCreated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sub.unsubscribe();
        sub.unsubscribe();
        bus.publish(msg(EventType::TaskCreated));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn history_is_bounded_and_chronological() {
        let bus = MessageBus::new(3);
        for _ in 0..2 {
            bus.publish(msg(EventType::TaskCreated));
        }
        for _ in 0..3 {
            bus.publish(msg(EventType::WorkerSpawned));
        }

        let hist = bus.history(0);
        assert_eq!(hist.len(), 3);
        assert!(hist
            .iter()
            .all(|m| m.event_type == EventType::WorkerSpawned));

        let last_two = bus.history(2);
        assert_eq!(last_two.len(), 2);
    }

    #[test]
    fn reentrant_publish_from_handler_does_not_deadlock() {
        let bus = MessageBus::new(100);
        let inner = bus.clone();
        let _sub = bus.subscribe(EventType::TaskCreated, move |_| {
            inner.publish(BusMessage::new(EventType::SystemError));
        });

        bus.publish(msg(EventType::TaskCreated));
        assert_eq!(bus.history(0).len(), 2);
    }

    #[test]
    fn concurrent_publish_is_safe() {
        let bus = MessageBus::new(1000);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = bus.subscribe_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = bus.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    b.publish(BusMessage::new(EventType::WorkerOutput));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 400);
        assert_eq!(bus.history(0).len(), 400);
    }
}
