//! Tenant identity and auth-header signing.
//!
//! Before dispatch, the invoker derives a deterministic header set from the
//! tenant identity and a timestamp, then merges it into the call's metadata.
//! The token never crosses the wire: only the hex SHA-256 of
//! `token ‖ timestamp` does.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Timestamp the headers were signed at (always present).
pub const HEAD_TIMESTAMP: &str = "x-rpc-timestamp";
/// Tenant name (present when the tenant has a name).
pub const HEAD_ACCESS_TENANT: &str = "x-rpc-access-tenant";
/// Hex SHA-256 of `token ‖ timestamp` (present when the tenant has a token).
pub const HEAD_ACCESS_TOKEN: &str = "x-rpc-access-token";
/// Child-tenant name (present when the tenant has a child tenant).
pub const HEAD_ACCESS_CHILD_TENANT: &str = "x-rpc-access-child-tenant";

/// Caller identity used to derive signed authentication headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tenant {
    pub tenant: Option<String>,
    pub child_tenant: Option<String>,
    pub token: Option<String>,
}

impl Tenant {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            child_tenant: None,
            token: None,
        }
    }

    pub fn with_child_tenant(mut self, child: impl Into<String>) -> Self {
        self.child_tenant = Some(child.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Sign auth headers for `tenant` at an explicit timestamp.
///
/// Deterministic: identical inputs (timestamp included) produce an identical
/// header mapping. Headers whose source value is absent are omitted entirely.
pub fn sign(tenant: &Tenant, timestamp: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(HEAD_TIMESTAMP.to_string(), timestamp.to_string());

    if let Some(name) = &tenant.tenant {
        headers.insert(HEAD_ACCESS_TENANT.to_string(), name.clone());
    }
    if let Some(token) = &tenant.token {
        let digest = Sha256::digest(format!("{}{}", token, timestamp).as_bytes());
        headers.insert(HEAD_ACCESS_TOKEN.to_string(), hex::encode(digest));
    }
    if let Some(child) = &tenant.child_tenant {
        headers.insert(HEAD_ACCESS_CHILD_TENANT.to_string(), child.clone());
    }

    headers
}

/// Sign auth headers for `tenant` at the current wall clock (millisecond tick).
pub fn auth_headers(tenant: &Tenant) -> HashMap<String, String> {
    let timestamp = chrono::Utc::now().timestamp_millis().to_string();
    sign(tenant, &timestamp)
}

/// Replace the child-tenant header in place.
///
/// Only the child-tenant header is touched, and only when `child_tenant` is
/// non-absent; every other header is left unchanged.
pub fn replace_child_tenant(headers: &mut HashMap<String, String>, child_tenant: Option<&str>) {
    if let Some(child) = child_tenant {
        headers.insert(HEAD_ACCESS_CHILD_TENANT.to_string(), child.to_string());
    }
}
