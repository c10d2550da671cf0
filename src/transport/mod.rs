//! Transport seam between the invocation layer and the wire.
//!
//! The pool dials endpoints through a [`Transport`] and dispatches calls over
//! the resulting [`Channel`]s. Payloads are opaque bytes here; marshalling is
//! the codec collaborator's job. A dialed channel also reports its own health
//! through a watch feed, which is what drives pool state transitions.

pub mod mem;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::endpoint::Endpoint;
use crate::error::Error;

/// A request as handed to the transport: call metadata plus opaque payload.
#[derive(Debug, Clone, Default)]
pub struct RequestFrame {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn new(headers: HashMap<String, String>, payload: Bytes) -> Self {
        Self { headers, payload }
    }
}

/// A response as handed back by the transport.
///
/// Every response carries a numeric status code and an error string; code `0`
/// means success and any non-zero code is mapped by the invoker to a
/// classified failure with the string as its message.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub code: u32,
    pub error: String,
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn ok(payload: Bytes) -> Self {
        Self {
            code: 0,
            error: String::new(),
            payload,
        }
    }

    pub fn status(code: u32, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
            payload: Bytes::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Health of a live channel, as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelHealth {
    Ready,
    TransientFailure,
}

/// Receiver half of a server stream: ordered response frames, closed on
/// normal completion, with transport failures delivered in-band.
pub type ServerStream = mpsc::Receiver<Result<ResponseFrame, Error>>;

/// Sender half of a client stream plus the receiver for the single response.
/// Dropping the sender signals end-of-input to the remote peer.
pub type ClientStream = (
    mpsc::Sender<RequestFrame>,
    oneshot::Receiver<Result<ResponseFrame, Error>>,
);

/// A single logical channel bound to one endpoint.
#[async_trait]
pub trait Channel: Send + Sync {
    /// One request, one response.
    async fn unary(&self, request: RequestFrame) -> Result<ResponseFrame, Error>;

    /// One request, zero or more ordered responses.
    async fn server_streaming(&self, request: RequestFrame) -> Result<ServerStream, Error>;

    /// Zero or more requests pushed by the caller, one response.
    async fn client_streaming(&self) -> Result<ClientStream, Error>;
}

impl std::fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Channel")
    }
}

/// A freshly dialed channel together with its health feed.
pub struct Dialed {
    pub channel: Arc<dyn Channel>,
    pub health: watch::Receiver<ChannelHealth>,
}

impl std::fmt::Debug for Dialed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialed")
            .field("health", &*self.health.borrow())
            .finish_non_exhaustive()
    }
}

/// Dials endpoints. Implementations own all wire-level concerns.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self, endpoint: &Endpoint) -> Result<Dialed, Error>;
}
