//! In-process transport.
//!
//! Serves two purposes: a local-loop transport for single-process setups and
//! the test double for everything above the transport seam. Behavior is
//! scripted per endpoint: dial latency and failure, unary handlers, streamed
//! response items, and health flaps injected after the dial.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use super::{
    Channel, ChannelHealth, ClientStream, Dialed, RequestFrame, ResponseFrame, ServerStream,
    Transport,
};
use crate::endpoint::Endpoint;
use crate::error::Error;

type UnaryHandler = Arc<dyn Fn(RequestFrame) -> ResponseFrame + Send + Sync>;
type ClientStreamHandler = Arc<dyn Fn(Vec<RequestFrame>) -> ResponseFrame + Send + Sync>;

/// Per-endpoint script. Unset pieces fall back to echoing the request.
#[derive(Default, Clone)]
struct Script {
    fail_dial: bool,
    response_delay: Duration,
    unary: Option<UnaryHandler>,
    stream_items: Vec<ResponseFrame>,
    stream_item_delay: Duration,
    stream_trailing_error: Option<String>,
    client_stream: Option<ClientStreamHandler>,
}

#[derive(Default)]
struct Inner {
    dial_delay: Mutex<Duration>,
    scripts: Mutex<HashMap<Endpoint, Script>>,
    dial_counts: Mutex<HashMap<Endpoint, Arc<AtomicUsize>>>,
    health_feeds: Mutex<HashMap<Endpoint, Vec<watch::Sender<ChannelHealth>>>>,
}

/// Scriptable in-process [`Transport`].
///
/// Cloning shares the script table, so a test can keep a handle for steering
/// while the pool owns another.
#[derive(Clone, Default)]
pub struct MemTransport {
    inner: Arc<Inner>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every dial.
    pub fn set_dial_delay(&self, delay: Duration) {
        *self.inner.dial_delay.lock().unwrap() = delay;
    }

    /// Make dials to `endpoint` fail (until cleared).
    pub fn fail_dials(&self, endpoint: &Endpoint, fail: bool) {
        self.with_script(endpoint, |s| s.fail_dial = fail);
    }

    /// Latency added before every unary response from `endpoint`.
    pub fn set_response_delay(&self, endpoint: &Endpoint, delay: Duration) {
        self.with_script(endpoint, |s| s.response_delay = delay);
    }

    /// Unary handler for `endpoint`; default echoes the request payload.
    pub fn handle_unary<F>(&self, endpoint: &Endpoint, handler: F)
    where
        F: Fn(RequestFrame) -> ResponseFrame + Send + Sync + 'static,
    {
        self.with_script(endpoint, |s| s.unary = Some(Arc::new(handler)));
    }

    /// Frames a server-streaming call against `endpoint` will emit, with an
    /// optional delay between items.
    pub fn script_stream(&self, endpoint: &Endpoint, items: Vec<ResponseFrame>, delay: Duration) {
        self.with_script(endpoint, |s| {
            s.stream_items = items;
            s.stream_item_delay = delay;
        });
    }

    /// Terminate the scripted stream with a transport failure instead of
    /// normal completion.
    pub fn script_stream_error(&self, endpoint: &Endpoint, reason: impl Into<String>) {
        let reason = reason.into();
        self.with_script(endpoint, |s| s.stream_trailing_error = Some(reason));
    }

    /// Handler that receives all pushed requests of a client-streaming call
    /// once the caller closes the sink; default echoes the concatenated count.
    pub fn handle_client_stream<F>(&self, endpoint: &Endpoint, handler: F)
    where
        F: Fn(Vec<RequestFrame>) -> ResponseFrame + Send + Sync + 'static,
    {
        self.with_script(endpoint, |s| s.client_stream = Some(Arc::new(handler)));
    }

    /// Number of dials attempted against `endpoint`.
    pub fn dial_count(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .dial_counts
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Push a health transition to every live channel for `endpoint`,
    /// pruning feeds whose channel is gone.
    pub fn set_health(&self, endpoint: &Endpoint, health: ChannelHealth) {
        let mut feeds = self.inner.health_feeds.lock().unwrap();
        if let Some(senders) = feeds.get_mut(endpoint) {
            senders.retain(|tx| tx.send(health).is_ok());
        }
    }

    fn with_script(&self, endpoint: &Endpoint, f: impl FnOnce(&mut Script)) {
        let mut scripts = self.inner.scripts.lock().unwrap();
        f(scripts.entry(endpoint.clone()).or_default())
    }

    fn script(&self, endpoint: &Endpoint) -> Script {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Dialed, Error> {
        let counter = {
            let mut counts = self.inner.dial_counts.lock().unwrap();
            counts.entry(endpoint.clone()).or_default().clone()
        };
        counter.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.dial_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.script(endpoint).fail_dial {
            debug!(endpoint = %endpoint, "scripted dial failure");
            return Err(Error::connection(endpoint.clone(), "connection refused"));
        }

        let (health_tx, health_rx) = watch::channel(ChannelHealth::Ready);
        self.inner
            .health_feeds
            .lock()
            .unwrap()
            .entry(endpoint.clone())
            .or_default()
            .push(health_tx);

        let channel = Arc::new(MemChannel {
            endpoint: endpoint.clone(),
            transport: self.clone(),
        });
        Ok(Dialed {
            channel,
            health: health_rx,
        })
    }
}

struct MemChannel {
    endpoint: Endpoint,
    transport: MemTransport,
}

#[async_trait]
impl Channel for MemChannel {
    async fn unary(&self, request: RequestFrame) -> Result<ResponseFrame, Error> {
        let script = self.transport.script(&self.endpoint);
        if !script.response_delay.is_zero() {
            tokio::time::sleep(script.response_delay).await;
        }
        Ok(match &script.unary {
            Some(handler) => handler(request),
            None => ResponseFrame::ok(request.payload),
        })
    }

    async fn server_streaming(&self, _request: RequestFrame) -> Result<ServerStream, Error> {
        let script = self.transport.script(&self.endpoint);
        let endpoint = self.endpoint.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for item in script.stream_items {
                if !script.stream_item_delay.is_zero() {
                    tokio::time::sleep(script.stream_item_delay).await;
                }
                if tx.send(Ok(item)).await.is_err() {
                    return;
                }
            }
            if let Some(reason) = script.stream_trailing_error {
                let _ = tx.send(Err(Error::connection(endpoint, reason))).await;
            }
            // Dropping the sender closes the stream: normal completion.
        });

        Ok(rx)
    }

    async fn client_streaming(&self) -> Result<ClientStream, Error> {
        let script = self.transport.script(&self.endpoint);
        let (req_tx, mut req_rx) = mpsc::channel::<RequestFrame>(16);
        let (resp_tx, resp_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(frame) = req_rx.recv().await {
                received.push(frame);
            }
            let response = match &script.client_stream {
                Some(handler) => handler(received),
                None => ResponseFrame::ok(format!("{}", received.len()).into()),
            };
            let _ = resp_tx.send(Ok(response));
        });

        Ok((req_tx, resp_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_dial_counts_and_echo() {
        let transport = MemTransport::new();
        let ep = Endpoint::new("db1", 8831);

        let dialed = transport.dial(&ep).await.unwrap();
        assert_eq!(transport.dial_count(&ep), 1);

        let frame = RequestFrame::new(HashMap::new(), Bytes::from_static(b"ping"));
        let resp = dialed.channel.unary(frame).await.unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_scripted_dial_failure() {
        let transport = MemTransport::new();
        let ep = Endpoint::new("db1", 8831);
        transport.fail_dials(&ep, true);

        let err = transport.dial(&ep).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));

        transport.fail_dials(&ep, false);
        assert!(transport.dial(&ep).await.is_ok());
        assert_eq!(transport.dial_count(&ep), 2);
    }

    #[tokio::test]
    async fn test_health_injection_reaches_channel() {
        let transport = MemTransport::new();
        let ep = Endpoint::new("db1", 8831);
        let mut dialed = transport.dial(&ep).await.unwrap();

        transport.set_health(&ep, ChannelHealth::TransientFailure);
        dialed.health.changed().await.unwrap();
        assert_eq!(*dialed.health.borrow(), ChannelHealth::TransientFailure);
    }

    #[tokio::test]
    async fn test_set_health_prunes_dropped_channels() {
        let transport = MemTransport::new();
        let ep = Endpoint::new("db1", 8831);

        let stale = transport.dial(&ep).await.unwrap();
        drop(stale);
        let live = transport.dial(&ep).await.unwrap();

        transport.set_health(&ep, ChannelHealth::TransientFailure);
        let feeds = transport.inner.health_feeds.lock().unwrap();
        assert_eq!(feeds.get(&ep).map(Vec::len), Some(1));
        drop(feeds);

        assert_eq!(*live.health.borrow(), ChannelHealth::TransientFailure);
    }

    #[tokio::test]
    async fn test_scripted_stream_completes() {
        let transport = MemTransport::new();
        let ep = Endpoint::new("db1", 8831);
        transport.script_stream(
            &ep,
            vec![
                ResponseFrame::ok(Bytes::from_static(b"a")),
                ResponseFrame::ok(Bytes::from_static(b"b")),
            ],
            Duration::ZERO,
        );

        let dialed = transport.dial(&ep).await.unwrap();
        let mut stream = dialed
            .channel
            .server_streaming(RequestFrame::default())
            .await
            .unwrap();

        assert_eq!(stream.recv().await.unwrap().unwrap().payload, "a");
        assert_eq!(stream.recv().await.unwrap().unwrap().payload, "b");
        assert!(stream.recv().await.is_none());
    }
}
