//! In-process backend for local development.
//!
//! Sandboxes are entries in a map with a made-up private IP. Nothing is
//! actually started.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use super::{ConnectionInfo, Endpoint, SandboxBackend, SandboxSpec};
use crate::config::EndpointFormat;
use crate::error::BackendError;

pub struct MemoryBackend {
    endpoint: EndpointFormat,
    /// sandbox name → assigned IP
    sandboxes: RwLock<HashMap<String, String>>,
    next_host: AtomicU32,
}

impl MemoryBackend {
    pub fn new(endpoint: EndpointFormat) -> Self {
        Self {
            endpoint,
            sandboxes: RwLock::new(HashMap::new()),
            next_host: AtomicU32::new(1),
        }
    }

    /// Number of sandboxes currently alive.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sandboxes.read().await.len()
    }

    /// Next address in 10.0.0.0/8, skipping network (.0) and broadcast (.255) hosts.
    fn next_ip(&self) -> String {
        loop {
            let n = self.next_host.fetch_add(1, Ordering::Relaxed);
            let host = n & 0xff;
            if host != 0 && host != 0xff {
                return format!("10.{}.{}.{}", (n >> 16) & 0xff, (n >> 8) & 0xff, host);
            }
        }
    }

    fn info(&self, name: &str, ip: &str) -> ConnectionInfo {
        ConnectionInfo {
            sandbox_id: name.to_string(),
            endpoint: Endpoint::from_ip(Some(ip), &self.endpoint),
        }
    }
}

#[async_trait]
impl SandboxBackend for MemoryBackend {
    async fn create(&self, spec: &SandboxSpec) -> Result<ConnectionInfo, BackendError> {
        let mut sandboxes = self.sandboxes.write().await;
        if sandboxes.contains_key(&spec.name) {
            return Err(BackendError::Provision(format!(
                "sandbox {} already exists",
                spec.name
            )));
        }
        let ip = self.next_ip();
        info!(
            sandbox_id = %spec.name,
            image = %spec.template.image,
            ip = %ip,
            "created in-memory sandbox"
        );
        let info = self.info(&spec.name, &ip);
        sandboxes.insert(spec.name.clone(), ip);
        Ok(info)
    }

    async fn describe(&self, sandbox_id: &str) -> Result<ConnectionInfo, BackendError> {
        let sandboxes = self.sandboxes.read().await;
        let ip = sandboxes
            .get(sandbox_id)
            .ok_or_else(|| BackendError::NotFound(sandbox_id.to_string()))?;
        Ok(self.info(sandbox_id, ip))
    }

    async fn delete(&self, sandbox_id: &str) -> Result<(), BackendError> {
        self.sandboxes
            .write()
            .await
            .remove(sandbox_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(sandbox_id.to_string()))
    }
}
