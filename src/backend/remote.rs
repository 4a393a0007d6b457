//! HTTP client for the container-group orchestration API.
//!
//! Talks to a resource-manager style REST API (Azure Container Instances
//! shape). Every sandbox is one container group named after the sandbox id:
//!
//! PUT/GET/DELETE {api_url}/subscriptions/{sub}/resourceGroups/{rg}/providers/
//! Microsoft.ContainerInstance/containerGroups/{name}?api-version={version}
//!
//! Create and delete are long-running at the API; both are polled to
//! completion here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ConnectionInfo, Endpoint, SandboxBackend, SandboxSpec};
use crate::config::{BackendTarget, EndpointFormat};
use crate::error::BackendError;

// ── Response types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
struct ContainerGroupResponse {
    #[serde(default)]
    properties: GroupProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupProperties {
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    ip_address: Option<GroupIpAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GroupIpAddress {
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Provisioning {
    Pending,
    Succeeded,
    Failed(String),
}

impl ContainerGroupResponse {
    fn ip(&self) -> Option<&str> {
        self.properties
            .ip_address
            .as_ref()
            .and_then(|addr| addr.ip.as_deref())
    }

    /// A missing state is taken as settled.
    fn provisioning(&self) -> Provisioning {
        match self.properties.provisioning_state.as_deref() {
            None => Provisioning::Succeeded,
            Some(s) if s.eq_ignore_ascii_case("succeeded") => Provisioning::Succeeded,
            Some(s) if s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("canceled") => {
                Provisioning::Failed(s.to_string())
            }
            Some(_) => Provisioning::Pending,
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

pub struct RemoteBackend {
    client: reqwest::Client,
    target: BackendTarget,
    endpoint: EndpointFormat,
    poll_interval: Duration,
    max_polls: u32,
}

impl RemoteBackend {
    /// Every request, including each poll, is bounded by `request_timeout`.
    pub fn new(
        target: BackendTarget,
        endpoint: EndpointFormat,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10).min(request_timeout))
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Backend(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            target,
            endpoint,
            poll_interval: Duration::from_secs(5),
            max_polls: 120,
        })
    }

    /// Override how often and how many times long-running operations are polled.
    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }

    fn group_url(&self, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{}?api-version={}",
            self.target.api_url,
            self.target.subscription_id,
            self.target.resource_group,
            name,
            self.target.api_version,
        )
    }

    fn request(&self, method: Method, name: &str) -> RequestBuilder {
        let req = self.client.request(method, self.group_url(name));
        match &self.target.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// One Linux container with a public IP exposing the template port.
    fn create_body(&self, spec: &SandboxSpec) -> Value {
        let template = &spec.template;
        json!({
            "location": self.target.region,
            "properties": {
                "osType": "Linux",
                "containers": [{
                    "name": spec.name,
                    "properties": {
                        "image": template.image,
                        "resources": {
                            "requests": {
                                "cpu": template.cpu,
                                "memoryInGB": template.memory_gb,
                            }
                        },
                        "ports": [{ "port": template.port }],
                    }
                }],
                "ipAddress": {
                    "type": "Public",
                    "ports": [{ "protocol": "TCP", "port": template.port }],
                },
            }
        })
    }

    fn connection_info(&self, name: &str, group: &ContainerGroupResponse) -> ConnectionInfo {
        ConnectionInfo {
            sandbox_id: name.to_string(),
            endpoint: Endpoint::from_ip(group.ip(), &self.endpoint),
        }
    }

    async fn fetch(&self, name: &str) -> Result<ContainerGroupResponse, BackendError> {
        let resp = self
            .request(Method::GET, name)
            .send()
            .await
            .map_err(|e| send_error(e, "get container group", BackendError::Backend))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(name.to_string()));
        }

        let resp = ensure_success(resp, "get container group", BackendError::Backend).await?;
        parse_group(resp).await
    }

    async fn wait_until_provisioned(
        &self,
        name: &str,
        mut group: ContainerGroupResponse,
    ) -> Result<ContainerGroupResponse, BackendError> {
        let mut polls = 0;
        loop {
            match group.provisioning() {
                Provisioning::Succeeded => return Ok(group),
                Provisioning::Failed(state) => {
                    return Err(BackendError::Provision(format!(
                        "container group {name} ended in state {state}"
                    )));
                }
                Provisioning::Pending => {}
            }
            if polls >= self.max_polls {
                return Err(BackendError::Timeout);
            }
            polls += 1;
            debug!(sandbox_id = %name, polls, "container group still provisioning");
            tokio::time::sleep(self.poll_interval).await;
            group = self.fetch(name).await?;
        }
    }

    async fn wait_until_gone(&self, name: &str) -> Result<(), BackendError> {
        for polls in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            match self.fetch(name).await {
                Err(BackendError::NotFound(_)) => return Ok(()),
                Ok(_) => debug!(sandbox_id = %name, polls, "container group still deleting"),
                Err(e) => return Err(e),
            }
        }
        Err(BackendError::Timeout)
    }
}

#[async_trait]
impl SandboxBackend for RemoteBackend {
    async fn create(&self, spec: &SandboxSpec) -> Result<ConnectionInfo, BackendError> {
        info!(
            sandbox_id = %spec.name,
            image = %spec.template.image,
            region = %self.target.region,
            "creating container group"
        );

        let resp = self
            .request(Method::PUT, &spec.name)
            .json(&self.create_body(spec))
            .send()
            .await
            .map_err(|e| send_error(e, "create container group", BackendError::Provision))?;

        let resp = ensure_success(resp, "create container group", BackendError::Provision).await?;
        let group = parse_group(resp).await?;
        let group = self.wait_until_provisioned(&spec.name, group).await?;

        let info = self.connection_info(&spec.name, &group);
        info!(sandbox_id = %spec.name, endpoint = %info.endpoint, "container group provisioned");
        Ok(info)
    }

    async fn describe(&self, sandbox_id: &str) -> Result<ConnectionInfo, BackendError> {
        let group = self.fetch(sandbox_id).await?;
        Ok(self.connection_info(sandbox_id, &group))
    }

    async fn delete(&self, sandbox_id: &str) -> Result<(), BackendError> {
        info!(sandbox_id = %sandbox_id, "deleting container group");

        let resp = self
            .request(Method::DELETE, sandbox_id)
            .send()
            .await
            .map_err(|e| send_error(e, "delete container group", BackendError::Backend))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(sandbox_id.to_string())),
            StatusCode::ACCEPTED => self.wait_until_gone(sandbox_id).await,
            _ => {
                ensure_success(resp, "delete container group", BackendError::Backend).await?;
                Ok(())
            }
        }
    }
}

/// A request that ran out of time may still have taken effect at the API.
fn send_error(e: reqwest::Error, what: &str, wrap: fn(String) -> BackendError) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        wrap(format!("{what} failed: {e}"))
    }
}

async fn ensure_success(
    resp: Response,
    what: &str,
    wrap: fn(String) -> BackendError,
) -> Result<Response, BackendError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(wrap(format!("{what} returned {status}: {body}")))
}

async fn parse_group(resp: Response) -> Result<ContainerGroupResponse, BackendError> {
    resp.json::<ContainerGroupResponse>()
        .await
        .map_err(|e| BackendError::Serde(format!("failed to parse container group: {e}")))
}
