//! Sandbox provisioning backends.
//!
//! A backend owns the actual lifecycle of a sandbox at the orchestration
//! service: creating it from a template, reporting its connection info, and
//! tearing it down. Long-running operations are awaited to completion inside
//! the backend, so each call looks like a single step to the manager.

mod memory;
mod remote;

pub use memory::MemoryBackend;
pub use remote::RemoteBackend;

use std::fmt;

use async_trait::async_trait;

use crate::config::{EndpointFormat, SandboxTemplate};
use crate::error::BackendError;

/// Returned in place of an address when the backend has not assigned an IP yet.
pub const ENDPOINT_UNAVAILABLE: &str = "Container IP Address not available";

/// Where a client can reach a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Address(String),
    Unavailable,
}

impl Endpoint {
    /// Build the client-facing address from a sandbox IP, if it has one.
    pub fn from_ip(ip: Option<&str>, format: &EndpointFormat) -> Self {
        match ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            Some(ip) => Endpoint::Address(format!("{}://{}:{}", format.scheme, ip, format.port)),
            None => Endpoint::Unavailable,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Address(addr) => f.write_str(addr),
            Endpoint::Unavailable => f.write_str(ENDPOINT_UNAVAILABLE),
        }
    }
}

/// Connection details for a sandbox, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub sandbox_id: String,
    pub endpoint: Endpoint,
}

/// Everything a backend needs to create one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub template: SandboxTemplate,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Create a sandbox and wait until it is provisioned.
    async fn create(&self, spec: &SandboxSpec) -> Result<ConnectionInfo, BackendError>;

    /// Current connection info for an existing sandbox.
    ///
    /// Returns `BackendError::NotFound` if the backend does not know the id.
    async fn describe(&self, sandbox_id: &str) -> Result<ConnectionInfo, BackendError>;

    /// Tear a sandbox down and wait until it is gone.
    async fn delete(&self, sandbox_id: &str) -> Result<(), BackendError>;
}
