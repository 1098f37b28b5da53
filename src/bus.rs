//! Process-wide event bus between the control plane and its observers.
//!
//! Construct one [`EventBus`] at startup and pass it as `Arc<EventBus>` to
//! every component. Handlers run synchronously on the publishing task; a
//! panicking handler is logged and skipped so the rest still receive the
//! event. A bounded broadcast queue is also fed for consumers that prefer to
//! drain events on their own loop (a UI tick, a websocket pump).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;

use crate::sandbox::Sandbox;
use crate::supervisor::{LogStream, ProcessKind, ProcessStatus};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SandboxStarted,
    SandboxStopped,
    SandboxImported,
    SandboxRemoved,
    SandboxesRefreshed,
    AgentStatusChanged,
    AgentLog,
    ConfigUpdated,
    AppStarted,
    AppShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SandboxStarted {
        name: String,
    },
    SandboxStopped {
        name: String,
    },
    SandboxImported {
        name: String,
    },
    SandboxRemoved {
        name: String,
    },
    SandboxesRefreshed {
        sandboxes: Vec<Sandbox>,
    },
    AgentStatusChanged {
        sandbox: String,
        kind: ProcessKind,
        status: ProcessStatus,
        #[serde(default)]
        message: Option<String>,
    },
    AgentLog {
        sandbox: String,
        kind: ProcessKind,
        stream: LogStream,
        line: String,
        timestamp: DateTime<Utc>,
    },
    ConfigUpdated {
        sandbox: String,
    },
    AppStarted,
    AppShutdown,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SandboxStarted { .. } => EventKind::SandboxStarted,
            Event::SandboxStopped { .. } => EventKind::SandboxStopped,
            Event::SandboxImported { .. } => EventKind::SandboxImported,
            Event::SandboxRemoved { .. } => EventKind::SandboxRemoved,
            Event::SandboxesRefreshed { .. } => EventKind::SandboxesRefreshed,
            Event::AgentStatusChanged { .. } => EventKind::AgentStatusChanged,
            Event::AgentLog { .. } => EventKind::AgentLog,
            Event::ConfigUpdated { .. } => EventKind::ConfigUpdated,
            Event::AppStarted => EventKind::AppStarted,
            Event::AppShutdown => EventKind::AppShutdown,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Capacity of the broadcast queue.
const BUS_CAPACITY: usize = 256;

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by `subscribe`; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
    queue_tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (queue_tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_tx,
        }
    }

    /// Persistent subscription to one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, false, Arc::new(handler))
    }

    /// Subscription removed after its first delivery.
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, true, Arc::new(handler))
    }

    fn add(&self, kind: EventKind, once: bool, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push(Subscription { id, once, handler });
        id
    }

    /// Returns false if the id was unknown (already removed or consumed).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        for subs in subscribers.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver an event to every handler of its kind and to the queue.
    ///
    /// The subscriber lock is not held while handlers run, so handlers may
    /// subscribe, unsubscribe or publish.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut subscribers = self.lock();
            match subscribers.get_mut(&kind) {
                Some(subs) => {
                    let handlers = subs.iter().map(|s| Arc::clone(&s.handler)).collect();
                    subs.retain(|s| !s.once);
                    handlers
                }
                None => Vec::new(),
            }
        };

        for handler in handlers {
            invoke_isolated(&format!("{:?}", kind), || handler(&event));
        }

        // No receivers is fine.
        let _ = self.queue_tx.send(event);
    }

    /// Bounded queue of every published event, for consumers that poll.
    pub fn receiver(&self) -> broadcast::Receiver<Event> {
        self.queue_tx.subscribe()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map(|s| s.len()).unwrap_or(0)
    }

    /// Drop every subscription. Meant for test isolation.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<Subscription>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// Run an observer callback, logging instead of propagating a panic.
pub fn invoke_isolated<F: FnOnce()>(label: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!(callback = label, reason = %reason, "Observer callback panicked");
    }
}
