//! Startup configuration loaded from environment variables.
//!
//! Every value has a default so the service can run locally against the
//! in-memory backend without any setup. Defaults are not meant for production.

use std::str::FromStr;
use std::time::Duration;

/// Resource template applied to every sandbox the allocator creates.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxTemplate {
    pub image: String,
    pub cpu: f64,
    pub memory_gb: f64,
    /// Port exposed on the sandbox's public IP.
    pub port: u16,
}

/// How the connection address returned to clients is formed from a sandbox IP.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointFormat {
    pub scheme: String,
    pub port: u16,
}

/// Coordinates of the orchestration API and the account it operates in.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendTarget {
    pub api_url: String,
    pub api_version: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub region: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub target: BackendTarget,
    pub template: SandboxTemplate,
    pub endpoint: EndpointFormat,
    /// Deadline for a single create call, including polling to completion.
    pub create_timeout: Duration,
    /// Deadline for a single request to the orchestration API, and for a
    /// describe on the reuse path.
    pub request_timeout: Duration,
    /// Interval and cap for polling long-running backend operations.
    pub poll_interval: Duration,
    pub max_polls: u32,
    /// Create a fresh sandbox in the same call when a mapping turns out stale.
    pub reallocate_stale: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a key lookup (the environment in production).
    /// Tests pass a closure over a map to avoid mutating process-global state.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let target = BackendTarget {
            api_url: text("ACI_API_URL", "https://management.azure.com")
                .trim_end_matches('/')
                .to_string(),
            api_version: text("ACI_API_VERSION", "2023-05-01"),
            subscription_id: text("ACI_SUBSCRIPTION_ID", "dummy-sub-id"),
            resource_group: text("ACI_RESOURCE_GROUP", "dummy-resource-group"),
            region: text("ACI_REGION", "eastus"),
            bearer_token: lookup("ACI_BEARER_TOKEN").filter(|v| !v.is_empty()),
        };

        let template = SandboxTemplate {
            image: text("ACI_IMAGE", "mcr.microsoft.com/azuredocs/aci-helloworld"),
            cpu: parsed(&lookup, "ACI_CPU", 1.0),
            memory_gb: parsed(&lookup, "ACI_MEMORY_GB", 1.5),
            port: parsed(&lookup, "ACI_PORT", 80),
        };

        let endpoint = EndpointFormat {
            scheme: text("ACI_ENDPOINT_SCHEME", "ws"),
            port: parsed(&lookup, "ACI_ENDPOINT_PORT", 8080),
        };

        Config {
            target,
            template,
            endpoint,
            create_timeout: Duration::from_secs(parsed(
                &lookup,
                "ALLOCATOR_CREATE_TIMEOUT_SECS",
                300,
            )),
            request_timeout: Duration::from_secs(parsed(&lookup, "ACI_REQUEST_TIMEOUT_SECS", 30)),
            poll_interval: Duration::from_secs(parsed(&lookup, "ACI_POLL_INTERVAL_SECS", 5)),
            max_polls: parsed(&lookup, "ACI_MAX_POLLS", 120),
            reallocate_stale: parsed(&lookup, "ALLOCATOR_REALLOCATE_STALE", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
