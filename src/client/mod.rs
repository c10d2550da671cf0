//! The client facade: one constructed, owned object wiring config,
//! transport, pool, invoker, and metrics together. Nothing here is a
//! process-wide singleton; callers share an `RpcClient` by cloning it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec::Marshal;
use crate::config::RpcConfig;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::invoke::{Context, Invoker, Reply, RequestSink, StreamReply};
use crate::metrics::{Registry, Snapshot};
use crate::pool::{ConnectionEvent, ConnectionObserver, ConnectionPool};
use crate::signal::{MetricsDumpHandler, SignalRegistry};
use crate::transport::Transport;

/// Client-side remote-invocation layer over a shared connection pool.
///
/// Clones share the pool, the observer bus, and the metrics registry.
#[derive(Clone)]
pub struct RpcClient {
    config: Arc<RpcConfig>,
    pool: Arc<ConnectionPool>,
    invoker: Invoker,
    metrics: Arc<Registry>,
}

impl RpcClient {
    pub fn new(config: RpcConfig, transport: Arc<dyn Transport>) -> Self {
        let metrics = Arc::new(Registry::new());
        let pool = Arc::new(ConnectionPool::new(
            transport,
            config.connect_timeout(),
            metrics.clone(),
        ));
        let invoker = Invoker::new(
            pool.clone(),
            config.tenant(),
            config.default_invoke_timeout(),
            metrics.clone(),
        );
        Self {
            config: Arc::new(config),
            pool,
            invoker,
            metrics,
        }
    }

    /// True iff a ready connection to `endpoint` exists. Never creates one.
    pub fn check_connection(&self, endpoint: &Endpoint) -> bool {
        self.pool.check_connection(endpoint)
    }

    /// As [`check_connection`](Self::check_connection), creating and dialing
    /// a connection when none exists. Returns the pre-dial readiness.
    pub fn check_connection_or_create(&self, endpoint: &Endpoint) -> bool {
        self.pool.check_connection_or_create(endpoint)
    }

    /// Close the connection to `endpoint`. Idempotent.
    pub fn close_connection(&self, endpoint: &Endpoint) {
        self.pool.close_connection(endpoint)
    }

    /// Subscribe to connectivity transitions. Past events are not replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.pool.subscribe()
    }

    /// Register a callback-style connection observer.
    pub fn register_connection_observer(&self, observer: impl ConnectionObserver) {
        self.pool.register_connection_observer(observer)
    }

    /// Execute a call and await its single response. A `None` timeout means
    /// the configured default invoke timeout.
    pub async fn invoke_sync<Req, Resp>(
        &self,
        endpoint: &Endpoint,
        request: &Req,
        ctx: &Context,
        timeout: Option<Duration>,
    ) -> Result<Resp, Error>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        self.invoker.invoke_sync(endpoint, request, ctx, timeout).await
    }

    /// Schedule a call; the outcome arrives through the returned reply. A
    /// `None` timeout means the configured default invoke timeout.
    pub fn invoke_async<Req, Resp>(
        &self,
        endpoint: &Endpoint,
        request: Req,
        ctx: Context,
        timeout: Option<Duration>,
    ) -> Reply<Resp>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        self.invoker.invoke_async(endpoint, request, ctx, timeout)
    }

    /// One request, a stream of ordered responses.
    pub fn invoke_server_streaming<Req, Resp>(
        &self,
        endpoint: &Endpoint,
        request: Req,
        ctx: Context,
    ) -> StreamReply<Resp>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        self.invoker.invoke_server_streaming(endpoint, request, ctx)
    }

    /// Caller-pushed request stream, one response.
    pub fn invoke_client_streaming<Req, Resp>(
        &self,
        endpoint: &Endpoint,
        ctx: Context,
    ) -> (RequestSink<Req>, Reply<Resp>)
    where
        Req: Marshal,
        Resp: Marshal,
    {
        self.invoker.invoke_client_streaming(endpoint, ctx)
    }

    /// Point-in-time counters.
    pub fn metrics(&self) -> Snapshot {
        self.metrics.snapshot()
    }

    /// Install the diagnostic signal handler that dumps metrics to a file in
    /// the configured dump directory. Returns false where the platform has no
    /// signal support; that is a degradation, not an error.
    pub fn install_metrics_dump(&self) -> bool {
        let mut registry = SignalRegistry::new();
        registry.register(MetricsDumpHandler::new(
            self.metrics.clone(),
            self.config.dump_dir.clone(),
        ));
        registry.install()
    }

    /// Close every pooled connection.
    pub fn shutdown(&self) {
        self.pool.close_all();
    }
}
