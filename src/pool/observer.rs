//! Fan-out of connection-state transitions.
//!
//! Each subscriber gets its own event channel, so per-subscriber ordering is
//! exactly the order transitions occurred and a slow or dropped subscriber
//! never affects the others. The callback adapter on top isolates panicking
//! observers: a failure inside one handler is logged and swallowed, never
//! surfaced to the call path or to other observers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::endpoint::Endpoint;

/// A pool-level connectivity transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection established successfully.
    Ready(Endpoint),
    /// A transient failure: dial failure or a transport-level break.
    Failure(Endpoint),
    /// The connection has started shutting down; new calls fail immediately.
    Shutdown(Endpoint),
}

impl ConnectionEvent {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            ConnectionEvent::Ready(ep)
            | ConnectionEvent::Failure(ep)
            | ConnectionEvent::Shutdown(ep) => ep,
        }
    }
}

/// Callback-style observer, delivered on a pool-managed task.
pub trait ConnectionObserver: Send + 'static {
    fn on_ready(&self, endpoint: &Endpoint);
    fn on_failure(&self, endpoint: &Endpoint);
    fn on_shutdown(&self, endpoint: &Endpoint);
}

/// Registry of connection-state subscribers.
#[derive(Clone, Default)]
pub struct ObserverBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>>,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all subsequent events. Past events are not replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Register a callback-style observer.
    ///
    /// Events are delivered on a spawned task, one at a time and in order. A
    /// panic inside the observer is caught and logged; later events are still
    /// delivered to this observer and to everyone else.
    pub fn register(&self, observer: impl ConnectionObserver) {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let outcome = catch_unwind(AssertUnwindSafe(|| match &event {
                    ConnectionEvent::Ready(ep) => observer.on_ready(ep),
                    ConnectionEvent::Failure(ep) => observer.on_failure(ep),
                    ConnectionEvent::Shutdown(ep) => observer.on_shutdown(ep),
                }));
                if outcome.is_err() {
                    error!(
                        endpoint = %event.endpoint(),
                        event = ?event,
                        "connection observer panicked; event dropped for this observer"
                    );
                }
            }
        });
    }

    /// Deliver `event` to every live subscriber; prune subscribers that are gone.
    pub fn publish(&self, event: ConnectionEvent) {
        debug!(endpoint = %event.endpoint(), event = ?event, "connection event");
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
