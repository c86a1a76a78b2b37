use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::event::{parse_event, EventCategory, EventEnvelope};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives a connection's events. Calls happen synchronously on the task
/// that owns the connection, in arrival order.
pub trait EventListener: Send + Sync {
    fn on_event(&self, workspace_id: &str, envelope: &EventEnvelope) -> Result<(), ListenerError>;

    /// The event stream is open. `resumed` is true on every connect after the
    /// first one.
    fn on_connected(&self, _workspace_id: &str, _resumed: bool) {}

    /// The connection was torn down.
    fn on_closed(&self, _workspace_id: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerFilter {
    All,
    Category(EventCategory),
}

impl ListenerFilter {
    pub fn accepts(&self, envelope: &EventEnvelope) -> bool {
        match self {
            ListenerFilter::All => true,
            ListenerFilter::Category(category) => envelope.event.category() == Some(*category),
        }
    }
}

/// Unregisters on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Clone)]
struct ListenerSlot {
    id: u64,
    filter: ListenerFilter,
    listener: Arc<dyn EventListener>,
}

#[derive(Default)]
struct DispatcherInner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<ListenerSlot>>,
}

/// Fans one connection's event stream out to any number of listeners.
#[derive(Clone)]
pub struct EventDispatcher {
    workspace_id: Arc<str>,
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new(workspace_id: &str) -> Self {
        Self {
            workspace_id: Arc::from(workspace_id),
            inner: Arc::new(DispatcherInner::default()),
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn subscribe(&self, filter: ListenerFilter, listener: Arc<dyn EventListener>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push(ListenerSlot {
                id,
                filter,
                listener,
            });
        }

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Ok(mut listeners) = inner.listeners.lock() {
                listeners.retain(|slot| slot.id != id);
            };
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Decodes a raw stream item and dispatches it. Undecodable events are
    /// dropped.
    pub fn dispatch_raw(&self, value: Value) {
        match parse_event(value) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(err) => {
                warn!(workspace_id = %self.workspace_id, error = %err, "dropping malformed event");
            }
        }
    }

    pub fn dispatch(&self, envelope: &EventEnvelope) {
        debug!(
            workspace_id = %self.workspace_id,
            event_type = envelope.event.event_type(),
            "dispatching event"
        );
        for slot in self.snapshot() {
            if !slot.filter.accepts(envelope) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                slot.listener.on_event(&self.workspace_id, envelope)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    workspace_id = %self.workspace_id,
                    event_type = envelope.event.event_type(),
                    error = %err,
                    "event listener failed"
                ),
                Err(_) => warn!(
                    workspace_id = %self.workspace_id,
                    event_type = envelope.event.event_type(),
                    "event listener panicked"
                ),
            }
        }
    }

    pub fn connected(&self, resumed: bool) {
        for slot in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                slot.listener.on_connected(&self.workspace_id, resumed)
            }));
            if outcome.is_err() {
                warn!(workspace_id = %self.workspace_id, "connect listener panicked");
            }
        }
    }

    pub fn closed(&self) {
        for slot in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                slot.listener.on_closed(&self.workspace_id)
            }));
            if outcome.is_err() {
                warn!(workspace_id = %self.workspace_id, "close listener panicked");
            }
        }
    }

    // Listeners may subscribe or unsubscribe from inside a callback, so the
    // lock is never held while one runs.
    fn snapshot(&self) -> Vec<ListenerSlot> {
        self.inner
            .listeners
            .lock()
            .map(|listeners| listeners.clone())
            .unwrap_or_default()
    }
}
