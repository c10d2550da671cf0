//! On-demand diagnostics triggered by OS signals.
//!
//! The registry is assembled explicitly at startup and dispatches handlers in
//! descending priority order. A panicking handler is isolated and logged.
//! Platforms without signal support degrade to a no-op, never an error.

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::metrics::Registry;

/// Name of the signal used for diagnostic dumps.
pub const DUMP_SIGNAL: &str = "SIGUSR2";

const DUMP_FILE_NAME: &str = "rpcpool_metrics.log";

/// A diagnostic handler, run when the dump signal arrives.
pub trait SignalHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Higher priority runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn handle(&self, signal_name: &str);
}

/// Explicit, statically assembled handler registry.
#[derive(Default)]
pub struct SignalRegistry {
    handlers: Vec<Arc<dyn SignalHandler>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl SignalHandler) {
        self.handlers.push(Arc::new(handler));
        self.handlers.sort_by_key(|h| std::cmp::Reverse(h.priority()));
    }

    /// Run every handler, highest priority first. A handler failure is
    /// logged and does not stop the remaining handlers.
    pub fn dispatch(&self, signal_name: &str) {
        info!(signal = signal_name, handlers = self.handlers.len(), "handling signal");
        for handler in &self.handlers {
            let name = handler.name().to_string();
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(signal_name)));
            if outcome.is_err() {
                error!(handler = %name, signal = signal_name, "signal handler panicked");
            }
        }
    }

    /// Start listening for [`DUMP_SIGNAL`] on a spawned task.
    ///
    /// Returns true when the listener was installed; false on platforms
    /// without signal support, where this is a no-op.
    #[cfg(unix)]
    pub fn install(self) -> bool {
        use tokio::signal::unix::{signal, SignalKind};

        let mut stream = match signal(SignalKind::user_defined2()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "signal listener unavailable");
                return false;
            }
        };
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                self.dispatch(DUMP_SIGNAL);
            }
        });
        true
    }

    #[cfg(not(unix))]
    pub fn install(self) -> bool {
        warn!("signals unsupported on this platform; diagnostic dumps disabled");
        false
    }
}

/// Appends a timestamped metrics snapshot to a file on each dump signal.
pub struct MetricsDumpHandler {
    metrics: Arc<Registry>,
    out_dir: PathBuf,
}

impl MetricsDumpHandler {
    pub fn new(metrics: Arc<Registry>, out_dir: PathBuf) -> Self {
        Self { metrics, out_dir }
    }

    fn write_dump(&self, signal_name: &str) -> std::io::Result<PathBuf> {
        let path = self.out_dir.join(DUMP_FILE_NAME);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "-- rpcpool metrics at {} (signal: {})",
            chrono::Utc::now().to_rfc3339(),
            signal_name
        )?;
        write!(file, "{}", self.metrics.snapshot())?;
        file.flush()?;
        Ok(path)
    }
}

impl SignalHandler for MetricsDumpHandler {
    fn name(&self) -> &str {
        "metrics-dump"
    }

    fn priority(&self) -> i32 {
        97
    }

    fn handle(&self, signal_name: &str) {
        match self.write_dump(signal_name) {
            Ok(path) => info!(file = %path.display(), "wrote metrics dump"),
            Err(e) => error!(error = %e, "failed to write metrics dump"),
        }
    }
}
