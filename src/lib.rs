//! rpcpool - client-side remote invocation over pooled connections
//!
//! Multiplexes synchronous, asynchronous, server-streaming, and
//! client-streaming calls over at most one logical connection per endpoint,
//! tracks connection health, and fans connectivity transitions out to
//! subscribers. Wire encoding is behind the [`codec::Marshal`] seam and the
//! actual wire behind the [`transport::Transport`] seam; this crate owns the
//! pooling, dispatch, deadlines, and error classification in between.

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod invoke;
pub mod metrics;
pub mod pool;
pub mod signal;
pub mod transport;

pub use client::RpcClient;
pub use codec::Marshal;
pub use config::RpcConfig;
pub use endpoint::Endpoint;
pub use error::Error;
pub use invoke::{Context, Reply, RequestSink, StreamEvent, StreamReply};
pub use pool::{ConnState, ConnectionEvent, ConnectionObserver};
