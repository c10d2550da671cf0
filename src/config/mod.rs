use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Tenant;

/// Tenant identity block of the client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant name
    pub tenant: Option<String>,

    /// Child tenant name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_tenant: Option<String>,

    /// Secret token used to derive the signed token header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl From<TenantConfig> for Tenant {
    fn from(c: TenantConfig) -> Self {
        Tenant {
            tenant: c.tenant,
            child_tenant: c.child_tenant,
            token: c.token,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Dial timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Default per-call timeout in milliseconds, used when the caller passes none
    #[serde(default = "default_invoke_timeout_ms")]
    pub default_invoke_timeout_ms: u64,

    /// Directory that diagnostic dumps are written into
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,

    /// Tenant identity for signed auth headers; absent means unsigned calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<TenantConfig>,
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_invoke_timeout_ms() -> u64 {
    10_000
}

fn default_dump_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            default_invoke_timeout_ms: default_invoke_timeout_ms(),
            dump_dir: default_dump_dir(),
            tenant: None,
        }
    }
}

impl RpcConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn default_invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.default_invoke_timeout_ms)
    }

    pub fn tenant(&self) -> Option<Tenant> {
        self.tenant.clone().map(Tenant::from)
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<RpcConfig, String> {
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| format!("failed to read config file {:?}: {}", path.as_ref(), e))?;
    serde_yaml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
}
