use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Network address of a remote peer, used as the connection pool's key.
///
/// Immutable once constructed; equality and hashing are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Parses `host:port`. The port is required.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid endpoint (expected host:port): {}", s))?;
        if host.is_empty() {
            return Err(format!("invalid endpoint (empty host): {}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid endpoint port: {}", s))?;
        Ok(Endpoint::new(host, port))
    }
}
