//! The four call shapes, executed over pooled connections.
//!
//! Every shape resolves its connection through the pool (creating it if
//! absent), signs auth headers for the configured tenant, merges them into
//! the call metadata (call headers win), and enforces the call deadline at
//! every suspension point. Only `invoke_sync` suspends the issuing task; the
//! other shapes complete through channel-backed handles fed by spawned
//! tasks, never inline on the caller.

pub mod context;
pub mod reply;

pub use context::Context;
pub use reply::{Reply, RequestSink, StreamEvent, StreamReply};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::auth::{self, Tenant};
use crate::codec::Marshal;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::metrics::Registry;
use crate::pool::{ConnState, ConnectionPool};
use crate::transport::{RequestFrame, ResponseFrame};

/// Executes calls against connections obtained from the pool.
#[derive(Clone)]
pub struct Invoker {
    pool: Arc<ConnectionPool>,
    tenant: Option<Tenant>,
    default_timeout: Duration,
    metrics: Arc<Registry>,
}

impl Invoker {
    pub fn new(
        pool: Arc<ConnectionPool>,
        tenant: Option<Tenant>,
        default_timeout: Duration,
        metrics: Arc<Registry>,
    ) -> Self {
        Self {
            pool,
            tenant,
            default_timeout,
            metrics,
        }
    }

    /// Execute a call and await its single response.
    ///
    /// `timeout` falls back to the configured default invoke timeout when
    /// `None`. Fails with [`Error::Timeout`] when the timeout (or an earlier
    /// context deadline) elapses first, and with [`Error::Connection`] on
    /// transport failure; both carry the endpoint.
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
        self.metrics.incr_sync_calls();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let result = self.dispatch_unary(endpoint, request, ctx, timeout).await;
        self.note_outcome(&result);
        result
    }

    /// Schedule a call and return immediately.
    ///
    /// `timeout` falls back to the configured default invoke timeout when
    /// `None`. Exactly one terminal outcome is eventually delivered through
    /// the returned [`Reply`], from a pool-managed task, and never after the
    /// deadline without a timeout error first.
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
        self.metrics.incr_async_calls();
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, reply) = Reply::channel();
        let invoker = self.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let result = invoker
                .dispatch_unary(&endpoint, &request, &ctx, timeout)
                .await;
            invoker.note_outcome(&result);
            let _ = tx.send(result);
        });
        reply
    }

    /// One request, zero or more ordered responses.
    ///
    /// The stream ends with exactly one of [`StreamEvent::Completed`] or
    /// [`StreamEvent::Failed`]. Cancellation or an elapsed context deadline
    /// stops further `Next` delivery and terminates with `Failed`.
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
        self.metrics.incr_server_streams();
        let (tx, reply) = StreamReply::channel();
        let invoker = self.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let result = invoker
                .run_server_stream(&endpoint, request, &ctx, &tx)
                .await;
            invoker.note_outcome(&result);
            let _ = match result {
                Ok(()) => tx.send(StreamEvent::Completed),
                Err(e) => tx.send(StreamEvent::Failed(e)),
            };
        });
        reply
    }

    /// Zero or more caller-pushed requests, one response.
    ///
    /// Closing (or dropping) the sink signals end-of-input to the remote
    /// peer; the single response arrives through the returned [`Reply`].
    pub fn invoke_client_streaming<Req, Resp>(
        &self,
        endpoint: &Endpoint,
        ctx: Context,
    ) -> (RequestSink<Req>, Reply<Resp>)
    where
        Req: Marshal,
        Resp: Marshal,
    {
        self.metrics.incr_client_streams();
        let (sink, payloads) = RequestSink::channel(16);
        let (tx, reply) = Reply::channel();
        let invoker = self.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let result = invoker.run_client_stream(&endpoint, &ctx, payloads).await;
            invoker.note_outcome(&result);
            let _ = tx.send(result);
        });
        (sink, reply)
    }

    async fn dispatch_unary<Req, Resp>(
        &self,
        endpoint: &Endpoint,
        request: &Req,
        ctx: &Context,
        timeout: Duration,
    ) -> Result<Resp, Error>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        let start = Instant::now();
        let deadline = effective_deadline(ctx, start + timeout);
        let cancel = ctx.cancellation_token();

        let payload = request.to_bytes()?;
        let headers = self.signed_headers(ctx);

        let (conn, channel) = tokio::select! {
            acquired = self.pool.acquire(endpoint, Some(deadline)) => acquired?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let mut state = conn.watch_state();

        debug!(endpoint = %endpoint, "dispatching unary call");
        let call = channel.unary(RequestFrame::new(headers, payload));
        tokio::pin!(call);

        loop {
            tokio::select! {
                finished = &mut call => {
                    return decode_response(endpoint, finished?);
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::Timeout {
                        endpoint: endpoint.clone(),
                        elapsed: start.elapsed(),
                    });
                }
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow_and_update() == ConnState::Shutdown {
                        return Err(Error::connection(
                            endpoint.clone(),
                            "connection closed while call in flight",
                        ));
                    }
                }
            }
        }
    }

    async fn run_server_stream<Req, Resp>(
        &self,
        endpoint: &Endpoint,
        request: Req,
        ctx: &Context,
        tx: &mpsc::UnboundedSender<StreamEvent<Resp>>,
    ) -> Result<(), Error>
    where
        Req: Marshal,
        Resp: Marshal,
    {
        let start = Instant::now();
        let deadline = ctx.deadline();
        let cancel = ctx.cancellation_token();

        let payload = request.to_bytes()?;
        let headers = self.signed_headers(ctx);

        let (conn, channel) = tokio::select! {
            acquired = self.pool.acquire(endpoint, deadline) => acquired?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let mut state = conn.watch_state();

        debug!(endpoint = %endpoint, "opening server stream");
        let mut stream = tokio::select! {
            opened = channel.server_streaming(RequestFrame::new(headers, payload)) => opened?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until_opt(deadline) => {
                return Err(Error::Timeout { endpoint: endpoint.clone(), elapsed: start.elapsed() });
            }
        };

        loop {
            // Delivery after the deadline is suppressed even when the next
            // item is already buffered.
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Err(Error::Timeout {
                    endpoint: endpoint.clone(),
                    elapsed: start.elapsed(),
                });
            }

            tokio::select! {
                item = stream.recv() => match item {
                    None => return Ok(()),
                    Some(Ok(frame)) => {
                        if !frame.is_ok() {
                            return Err(Error::Server {
                                endpoint: endpoint.clone(),
                                code: frame.code,
                                message: frame.error,
                            });
                        }
                        let response = Resp::from_bytes(&frame.payload)?;
                        if tx.send(StreamEvent::Next(response)).is_err() {
                            // Receiver dropped the reply; nothing left to deliver.
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                },
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep_until_opt(deadline) => {
                    return Err(Error::Timeout { endpoint: endpoint.clone(), elapsed: start.elapsed() });
                }
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow_and_update() == ConnState::Shutdown {
                        return Err(Error::connection(
                            endpoint.clone(),
                            "connection closed while stream in flight",
                        ));
                    }
                }
            }
        }
    }

    async fn run_client_stream<Resp>(
        &self,
        endpoint: &Endpoint,
        ctx: &Context,
        mut payloads: mpsc::Receiver<Bytes>,
    ) -> Result<Resp, Error>
    where
        Resp: Marshal,
    {
        let start = Instant::now();
        let deadline = ctx.deadline();
        let cancel = ctx.cancellation_token();
        let headers = self.signed_headers(ctx);

        let (conn, channel) = tokio::select! {
            acquired = self.pool.acquire(endpoint, deadline) => acquired?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let mut state = conn.watch_state();

        debug!(endpoint = %endpoint, "opening client stream");
        let (frames, response) = tokio::select! {
            opened = channel.client_streaming() => opened?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until_opt(deadline) => {
                return Err(Error::Timeout { endpoint: endpoint.clone(), elapsed: start.elapsed() });
            }
        };
        tokio::pin!(response);

        // Dropping `frames` signals end-of-input to the peer.
        let mut frames = Some(frames);
        loop {
            tokio::select! {
                pushed = payloads.recv(), if frames.is_some() => match pushed {
                    Some(payload) => {
                        let frame = RequestFrame::new(headers.clone(), payload);
                        let sender = frames.as_ref().unwrap();
                        if sender.send(frame).await.is_err() {
                            return Err(Error::connection(
                                endpoint.clone(),
                                "request stream closed by transport",
                            ));
                        }
                    }
                    None => {
                        frames = None;
                    }
                },
                answered = &mut response => {
                    let frame = answered.map_err(|_| {
                        Error::connection(endpoint.clone(), "transport dropped the response")
                    })??;
                    return decode_response(endpoint, frame);
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep_until_opt(deadline) => {
                    return Err(Error::Timeout { endpoint: endpoint.clone(), elapsed: start.elapsed() });
                }
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow_and_update() == ConnState::Shutdown {
                        return Err(Error::connection(
                            endpoint.clone(),
                            "connection closed while stream in flight",
                        ));
                    }
                }
            }
        }
    }

    /// Auth headers for the configured tenant, overridden by call headers.
    fn signed_headers(&self, ctx: &Context) -> HashMap<String, String> {
        let mut headers = match &self.tenant {
            Some(tenant) => auth::auth_headers(tenant),
            None => HashMap::new(),
        };
        headers.extend(ctx.headers().clone());
        headers
    }

    fn note_outcome<T>(&self, result: &Result<T, Error>) {
        match result {
            Err(Error::Timeout { .. }) => self.metrics.incr_timeouts(),
            Err(Error::Cancelled) => self.metrics.incr_cancellations(),
            Err(Error::Server { .. }) => self.metrics.incr_server_errors(),
            _ => {}
        }
    }
}

fn effective_deadline(ctx: &Context, from_timeout: Instant) -> Instant {
    match ctx.deadline() {
        Some(at) => at.min(from_timeout),
        None => from_timeout,
    }
}

fn decode_response<Resp: Marshal>(
    endpoint: &Endpoint,
    frame: ResponseFrame,
) -> Result<Resp, Error> {
    if !frame.is_ok() {
        return Err(Error::Server {
            endpoint: endpoint.clone(),
            code: frame.code,
            message: frame.error,
        });
    }
    Resp::from_bytes(&frame.payload)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
