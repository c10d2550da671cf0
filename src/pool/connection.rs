//! Connection state and the per-endpoint connection pool.
//!
//! The pool owns at most one [`Connection`] per endpoint. Creation is
//! serialized through the entry map's write lock, so concurrent create
//! requests for the same endpoint converge on a single dial. State changes
//! are event-driven (dial outcome, transport-reported health, explicit
//! shutdown) and every transition is pushed to the observer bus, flapping
//! included.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::observer::{ConnectionEvent, ConnectionObserver, ObserverBus};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::metrics::Registry;
use crate::transport::{Channel, ChannelHealth, Dialed, Transport};

/// Observable health state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// A single logical channel bound to one endpoint.
///
/// Exclusively owned by its pool entry: only the pool mutates the state, and
/// only [`ConnectionPool::close_connection`] releases the transport resource.
pub struct Connection {
    endpoint: Endpoint,
    state_tx: watch::Sender<ConnState>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    // Held across every transition+publish pair so observers see this
    // connection's events in the order the transitions took effect.
    publish_order: Mutex<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(endpoint: Endpoint) -> Self {
        let (state_tx, _) = watch::channel(ConnState::Connecting);
        Self {
            endpoint,
            state_tx,
            channel: RwLock::new(None),
            publish_order: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    /// Watch state transitions; used by in-flight calls to notice shutdown.
    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().unwrap().clone()
    }

    fn install_channel(&self, channel: Arc<dyn Channel>) {
        *self.channel.write().unwrap() = Some(channel);
    }

    /// Move to `next` unless already there or shut down. Returns whether the
    /// state actually changed; a `false` means no observer event is due.
    fn transition(&self, next: ConnState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == ConnState::Shutdown || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    /// Apply `next` and, when the state actually changed, publish `event`
    /// before any other transition on this connection can publish its own.
    fn transition_published(
        &self,
        next: ConnState,
        bus: &ObserverBus,
        event: ConnectionEvent,
    ) -> bool {
        let _order = self.publish_order.lock().unwrap();
        if !self.transition(next) {
            return false;
        }
        bus.publish(event);
        true
    }

    /// Shut down, release the transport resource, and publish the shutdown
    /// event. A racing transition waits on the order lock and then loses: it
    /// cannot leave `Shutdown`, so nothing is published after the shutdown
    /// event.
    fn shut_down(&self, bus: &ObserverBus) -> bool {
        let _order = self.publish_order.lock().unwrap();
        let changed = self.transition(ConnState::Shutdown);
        *self.channel.write().unwrap() = None;
        if changed {
            bus.publish(ConnectionEvent::Shutdown(self.endpoint.clone()));
        }
        changed
    }
}

/// Owns at most one connection per endpoint; creates, health-tracks, and
/// destroys them, fanning out every transition to registered observers.
pub struct ConnectionPool {
    entries: RwLock<HashMap<Endpoint, Arc<Connection>>>,
    transport: Arc<dyn Transport>,
    bus: ObserverBus,
    connect_timeout: Duration,
    metrics: Arc<Registry>,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        connect_timeout: Duration,
        metrics: Arc<Registry>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            transport,
            bus: ObserverBus::new(),
            connect_timeout,
            metrics,
        }
    }

    /// True iff a connection exists for `endpoint` and is ready. Never
    /// creates anything; pure observation.
    pub fn check_connection(&self, endpoint: &Endpoint) -> bool {
        self.entries
            .read()
            .unwrap()
            .get(endpoint)
            .map(|conn| conn.is_ready())
            .unwrap_or(false)
    }

    /// As [`check_connection`](Self::check_connection), but registers a new
    /// connection and starts dialing when none exists. Returns the pre-dial
    /// readiness immediately; readiness becomes observable via the bus or a
    /// later `check_connection`.
    ///
    /// An entry left in `TransientFailure` by a failed dial is re-dialed
    /// here; plain `check_connection` never does that.
    pub fn check_connection_or_create(&self, endpoint: &Endpoint) -> bool {
        self.ensure_entry(endpoint).is_ready()
    }

    /// Close the connection for `endpoint`, if any. Idempotent: emits exactly
    /// one shutdown event per live entry and is a no-op afterwards.
    pub fn close_connection(&self, endpoint: &Endpoint) {
        let removed = self.entries.write().unwrap().remove(endpoint);
        if let Some(conn) = removed {
            if conn.shut_down(&self.bus) {
                info!(endpoint = %endpoint, "connection closed");
            }
        }
    }

    /// Close every pooled connection.
    pub fn close_all(&self) {
        let endpoints: Vec<Endpoint> = self.entries.read().unwrap().keys().cloned().collect();
        for ep in endpoints {
            self.close_connection(&ep);
        }
    }

    /// Subscribe to connectivity transitions. No replay of past events.
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent> {
        self.bus.subscribe()
    }

    /// Register a callback-style connection observer.
    pub fn register_connection_observer(&self, observer: impl ConnectionObserver) {
        self.bus.register(observer)
    }

    /// Resolve a ready channel for `endpoint`, creating the connection if
    /// absent and awaiting readiness up to `deadline`.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        deadline: Option<Instant>,
    ) -> Result<(Arc<Connection>, Arc<dyn Channel>), Error> {
        let start = Instant::now();
        let conn = self.ensure_entry(endpoint);
        let mut state = conn.watch_state();

        loop {
            match *state.borrow_and_update() {
                ConnState::Ready => {
                    if let Some(channel) = conn.channel() {
                        return Ok((conn, channel));
                    }
                }
                ConnState::TransientFailure => {
                    return Err(Error::connection(endpoint.clone(), "dial failed"));
                }
                ConnState::Shutdown => {
                    return Err(Error::connection(endpoint.clone(), "connection is shut down"));
                }
                ConnState::Connecting => {}
            }

            let changed = match deadline {
                Some(at) => tokio::time::timeout_at(at, state.changed())
                    .await
                    .map_err(|_| Error::Timeout {
                        endpoint: endpoint.clone(),
                        elapsed: start.elapsed(),
                    })?,
                None => state.changed().await,
            };
            if changed.is_err() {
                return Err(Error::connection(endpoint.clone(), "connection is shut down"));
            }
        }
    }

    /// Get-or-create the entry for `endpoint`, guaranteeing at most one dial
    /// in flight per endpoint.
    fn ensure_entry(&self, endpoint: &Endpoint) -> Arc<Connection> {
        if let Some(conn) = self.entries.read().unwrap().get(endpoint) {
            match conn.state() {
                ConnState::Ready | ConnState::Connecting => return conn.clone(),
                ConnState::TransientFailure | ConnState::Shutdown => {}
            }
        }

        let mut entries = self.entries.write().unwrap();
        match entries.entry(endpoint.clone()) {
            Entry::Occupied(occupied) => {
                let conn = occupied.get().clone();
                // Retry a previously failed dial. The write lock makes the
                // TransientFailure -> Connecting step single-writer, so two
                // racing creators start one dial.
                if conn.state() == ConnState::TransientFailure
                    && conn.transition(ConnState::Connecting)
                {
                    self.spawn_dial(conn.clone());
                }
                conn
            }
            Entry::Vacant(vacant) => {
                let conn = Arc::new(Connection::new(endpoint.clone()));
                vacant.insert(conn.clone());
                self.spawn_dial(conn.clone());
                conn
            }
        }
    }

    fn spawn_dial(&self, conn: Arc<Connection>) {
        let transport = self.transport.clone();
        let bus = self.bus.clone();
        let metrics = self.metrics.clone();
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            let endpoint = conn.endpoint().clone();
            metrics.incr_dials();
            debug!(endpoint = %endpoint, "dialing");

            let dialed = match tokio::time::timeout(connect_timeout, transport.dial(&endpoint)).await
            {
                Ok(Ok(dialed)) => dialed,
                Ok(Err(e)) => {
                    metrics.incr_dial_failures();
                    warn!(endpoint = %endpoint, error = %e, "dial failed");
                    conn.transition_published(
                        ConnState::TransientFailure,
                        &bus,
                        ConnectionEvent::Failure(endpoint),
                    );
                    return;
                }
                Err(_) => {
                    metrics.incr_dial_failures();
                    warn!(endpoint = %endpoint, timeout = ?connect_timeout, "dial timed out");
                    conn.transition_published(
                        ConnState::TransientFailure,
                        &bus,
                        ConnectionEvent::Failure(endpoint),
                    );
                    return;
                }
            };

            // The connection may have been closed while the dial was in
            // flight; in that case the channel is dropped, not installed.
            if conn.state() == ConnState::Shutdown {
                return;
            }
            let Dialed { channel, health } = dialed;
            conn.install_channel(channel);
            if conn.transition_published(
                ConnState::Ready,
                &bus,
                ConnectionEvent::Ready(endpoint.clone()),
            ) {
                info!(endpoint = %endpoint, "connection ready");
            }

            Self::watch_health(conn, health, bus).await;
        });
    }

    /// Mirror transport-reported health into the connection state until the
    /// connection shuts down or the transport drops the feed. Flapping is
    /// forwarded transition by transition, not filtered.
    async fn watch_health(
        conn: Arc<Connection>,
        mut health: watch::Receiver<ChannelHealth>,
        bus: ObserverBus,
    ) {
        let mut state = conn.watch_state();
        loop {
            tokio::select! {
                changed = health.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let endpoint = conn.endpoint().clone();
                    let (next, event) = match *health.borrow_and_update() {
                        ChannelHealth::Ready => {
                            (ConnState::Ready, ConnectionEvent::Ready(endpoint))
                        }
                        ChannelHealth::TransientFailure => {
                            (ConnState::TransientFailure, ConnectionEvent::Failure(endpoint))
                        }
                    };
                    conn.transition_published(next, &bus, event);
                }
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow_and_update() == ConnState::Shutdown {
                        break;
                    }
                }
            }
        }
    }
}
