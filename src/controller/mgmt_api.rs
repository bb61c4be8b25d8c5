//! HTTP client for the per-node management API
//!
//! Every node-instance runs a management sidecar in the database container
//! listening on `http://<pod-ip>:<port>/api/v0/...`. Pods are dialed by IP
//! because the ones we talk to are often not ready and have no DNS yet.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use reqwest::{Client, Method};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DEFAULT_MGMT_API_PORT: u16 = 8080;
pub const DEFAULT_MGMT_API_TIMEOUT: Duration = Duration::from_secs(60);

/// One node as seen by the ring
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct EndpointState {
    #[serde(rename = "HOST_ID", default)]
    pub host_id: String,
    #[serde(rename = "IS_ALIVE", default)]
    pub is_alive: String,
    #[serde(rename = "NATIVE_TRANSPORT_ADDRESS", default)]
    pub native_transport_address: String,
    #[serde(rename = "RPC_ADDRESS", default)]
    pub rpc_address: String,
    #[serde(rename = "STATUS", default)]
    pub status: String,
}

impl EndpointState {
    /// Client-facing address, preferring the native transport one
    pub fn address(&self) -> &str {
        if self.native_transport_address.is_empty() {
            &self.rpc_address
        } else {
            &self.native_transport_address
        }
    }
}

/// Ring membership as returned by `GET /api/v0/metadata/endpoints`
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct CassMetadataEndpoints {
    #[serde(default)]
    pub entity: Vec<EndpointState>,
}

impl CassMetadataEndpoints {
    pub fn for_address(&self, ip: &str) -> Option<&EndpointState> {
        self.entity.iter().find(|ep| ep.address() == ip)
    }

    /// Last known address of a node that may no longer be running
    pub fn address_for_host_id(&self, host_id: &str) -> Option<&str> {
        self.entity
            .iter()
            .find(|ep| ep.host_id == host_id && !ep.address().is_empty())
            .map(EndpointState::address)
    }
}

/// Operations the reconciler needs from a node's management API
#[async_trait]
pub trait NodeMgmt: Send + Sync {
    /// Start streaming the node's data to its peers and leave the ring
    async fn decommission(&self, pod: &Pod) -> Result<()>;

    /// Flush memtables and stop accepting writes ahead of a shutdown
    async fn drain(&self, pod: &Pod) -> Result<()>;

    /// Start the database process, optionally taking over a dead node's tokens
    async fn start(&self, pod: &Pod, replace_ip: Option<&str>) -> Result<()>;

    async fn metadata_endpoints(&self, pod: &Pod) -> Result<CassMetadataEndpoints>;
}

/// reqwest-backed [`NodeMgmt`]
pub struct NodeMgmtClient {
    http_client: Client,
    port: u16,
}

impl NodeMgmtClient {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: Client::builder().timeout(timeout).build()?,
            port,
        })
    }

    fn url(&self, pod: &Pod, endpoint: &str) -> Result<String> {
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| Error::NoPodIp(pod.name_any()))?;
        Ok(format!("http://{}:{}{}", ip, self.port, endpoint))
    }

    async fn call(&self, method: Method, pod: &Pod, endpoint: &str) -> Result<reqwest::Response> {
        let url = self.url(pod, endpoint)?;
        debug!("Calling management API {} {} for pod {}", method, url, pod.name_any());

        let response = self.http_client.request(method, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::MgmtApiError {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl NodeMgmt for NodeMgmtClient {
    async fn decommission(&self, pod: &Pod) -> Result<()> {
        info!("Requesting decommission of {}", pod.name_any());
        self.call(Method::POST, pod, "/api/v0/ops/node/decommission?force=true")
            .await
            .map(|_| ())
    }

    async fn drain(&self, pod: &Pod) -> Result<()> {
        info!("Draining {}", pod.name_any());
        self.call(Method::POST, pod, "/api/v0/ops/node/drain")
            .await
            .map(|_| ())
    }

    async fn start(&self, pod: &Pod, replace_ip: Option<&str>) -> Result<()> {
        let endpoint = match replace_ip {
            Some(ip) => format!("/api/v0/lifecycle/start?replace_ip={ip}"),
            None => "/api/v0/lifecycle/start".to_string(),
        };
        info!("Starting database on {} (replace: {:?})", pod.name_any(), replace_ip);
        self.call(Method::POST, pod, &endpoint).await.map(|_| ())
    }

    async fn metadata_endpoints(&self, pod: &Pod) -> Result<CassMetadataEndpoints> {
        let response = self
            .call(Method::GET, pod, "/api/v0/metadata/endpoints")
            .await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
