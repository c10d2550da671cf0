//! Per-call scope: deadline, cancellation, and attached metadata.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Created immediately before a call and discarded after it completes; never
/// shared across calls. Cancellation is cooperative: the invoker races every
/// suspension point against the token, it does not interrupt in-flight
/// transport work.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    headers: HashMap<String, String>,
    cancel: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute deadline for the call.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Attach a metadata header. Call headers override signed auth headers on
    /// conflict.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Token that trips when the call is cancelled. Clone it before issuing
    /// the call to cancel from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
