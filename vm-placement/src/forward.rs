use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{PlacementError, Result};

/// Creation request as accepted by a host agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostCreateRequest {
    pub service_cluster_id: i64,
    pub name: String,
    pub user_id: i64,
    pub os_type: String,
    pub cpu_count: i64,
    pub memory_size_mib: i64,
    pub disk_size_gb: i64,
    pub vm_offer_id: i64,
    pub system_image_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
}

/// HTTP client for the host agents' VM creation endpoint.
#[derive(Clone)]
pub struct HostAgentClient {
    client: Client,
    port: u16,
}

impl HostAgentClient {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PlacementError::Forward {
                url: String::new(),
                status: None,
                message: format!("cannot build HTTP client: {}", e),
            })?;
        Ok(Self { client, port })
    }

    pub fn create_url(&self, host_ip: &str) -> String {
        format!("http://{}:{}/api/v1/vms", host_ip, self.port)
    }

    /// POST the request to the host and return its JSON answer. Not retried.
    pub async fn create_vm(&self, host_ip: &str, request: &HostCreateRequest) -> Result<Value> {
        let url = self.create_url(host_ip);
        info!("Forwarding creation of '{}' to {}", request.name, url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| PlacementError::Forward {
                url: url.clone(),
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Host agent at {} answered {}: {}", url, status, body);
            return Err(PlacementError::Forward {
                url,
                status: Some(status.as_u16()),
                message: body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| PlacementError::Forward {
                url,
                status: Some(status.as_u16()),
                message: format!("invalid JSON response: {}", e),
            })
    }
}
