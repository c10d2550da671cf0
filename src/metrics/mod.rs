//! Client-side counters, dumped on demand by the diagnostic signal handler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter registry. Cheap to update from any task.
#[derive(Debug, Default)]
pub struct Registry {
    dials: AtomicU64,
    dial_failures: AtomicU64,
    sync_calls: AtomicU64,
    async_calls: AtomicU64,
    server_streams: AtomicU64,
    client_streams: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    server_errors: AtomicU64,
}

macro_rules! counter {
    ($incr:ident, $field:ident) => {
        pub fn $incr(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(incr_dials, dials);
    counter!(incr_dial_failures, dial_failures);
    counter!(incr_sync_calls, sync_calls);
    counter!(incr_async_calls, async_calls);
    counter!(incr_server_streams, server_streams);
    counter!(incr_client_streams, client_streams);
    counter!(incr_timeouts, timeouts);
    counter!(incr_cancellations, cancellations);
    counter!(incr_server_errors, server_errors);

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            dials: self.dials.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            sync_calls: self.sync_calls.load(Ordering::Relaxed),
            async_calls: self.async_calls.load(Ordering::Relaxed),
            server_streams: self.server_streams.load(Ordering::Relaxed),
            client_streams: self.client_streams.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub dials: u64,
    pub dial_failures: u64,
    pub sync_calls: u64,
    pub async_calls: u64,
    pub server_streams: u64,
    pub client_streams: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub server_errors: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dials:          {}", self.dials)?;
        writeln!(f, "dial_failures:  {}", self.dial_failures)?;
        writeln!(f, "sync_calls:     {}", self.sync_calls)?;
        writeln!(f, "async_calls:    {}", self.async_calls)?;
        writeln!(f, "server_streams: {}", self.server_streams)?;
        writeln!(f, "client_streams: {}", self.client_streams)?;
        writeln!(f, "timeouts:       {}", self.timeouts)?;
        writeln!(f, "cancellations:  {}", self.cancellations)?;
        writeln!(f, "server_errors:  {}", self.server_errors)
    }
}
