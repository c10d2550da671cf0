use std::time::Duration;

use crate::endpoint::Endpoint;

/// Error types surfaced by the invocation layer.
///
/// Errors originating from the transport or from deadline expiry are always
/// delivered on the call's result channel; nothing is retried here. Retry
/// policy belongs to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable connection to the endpoint: dial failure, refused, or a
    /// transport-level break while the call was in flight.
    #[error("no usable connection to {endpoint}: {reason}")]
    Connection { endpoint: Endpoint, reason: String },

    /// The call's deadline elapsed before completion.
    #[error("invoke timed out after {elapsed:?} (endpoint: {endpoint})")]
    Timeout { endpoint: Endpoint, elapsed: Duration },

    /// The call's context was cancelled before completion.
    #[error("call cancelled")]
    Cancelled,

    /// Passed through unchanged from the encoding collaborator.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The server answered with a non-zero status code.
    #[error("server error {code} from {endpoint}: {message}")]
    Server {
        endpoint: Endpoint,
        code: u32,
        message: String,
    },
}

impl Error {
    pub(crate) fn connection(endpoint: Endpoint, reason: impl Into<String>) -> Self {
        Error::Connection {
            endpoint,
            reason: reason.into(),
        }
    }

    /// The endpoint this error is associated with, when known.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            Error::Connection { endpoint, .. }
            | Error::Timeout { endpoint, .. }
            | Error::Server { endpoint, .. } => Some(endpoint),
            Error::Cancelled | Error::Serialization(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let ep = Endpoint::new("db1", 8831);
        let err = Error::connection(ep.clone(), "connection refused");
        assert_eq!(
            err.to_string(),
            "no usable connection to db1:8831: connection refused"
        );

        let err = Error::Timeout {
            endpoint: ep,
            elapsed: Duration::from_millis(100),
        };
        assert!(err.to_string().contains("db1:8831"));
    }

    #[test]
    fn test_error_endpoint() {
        let ep = Endpoint::new("db1", 8831);
        assert_eq!(
            Error::connection(ep.clone(), "refused").endpoint(),
            Some(&ep)
        );
        assert_eq!(Error::Cancelled.endpoint(), None);
    }
}
