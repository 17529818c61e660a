use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use crate::error::{PlacementError, Result};
use crate::forward::{HostAgentClient, HostCreateRequest};
use crate::host::{ClusterHost, HostInventory};
use crate::ranking::{self, Requirement};

fn default_cpu_count() -> i64 {
    2
}

fn default_memory_size_mib() -> i64 {
    2048
}

fn default_disk_size_gb() -> i64 {
    5
}

fn default_offer_id() -> i64 {
    1
}

fn default_image_id() -> i64 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequest {
    #[serde(default = "default_cpu_count")]
    pub cpu_count: i64,
    #[serde(default = "default_memory_size_mib")]
    pub memory_size_mib: i64,
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: i64,
    #[serde(default = "default_offer_id")]
    pub vm_offer_id: i64,
    #[serde(default = "default_image_id")]
    pub system_image_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub root_password: Option<String>,
}

impl PlacementRequest {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count <= 0 || self.memory_size_mib <= 0 || self.disk_size_gb <= 0 {
            return Err(PlacementError::InvalidInput(
                "cpu_count, memory_size_mib and disk_size_gb must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn requirement(&self) -> Requirement {
        Requirement::new(self.cpu_count, self.memory_size_mib, self.disk_size_gb)
    }

    /// The host-agent request, when name, owner and OS type are all given.
    pub fn creation_for(&self, host: &ClusterHost) -> Option<HostCreateRequest> {
        let name = self.name.as_deref().filter(|n| !n.trim().is_empty())?;
        let os_type = self.os_type.as_deref().filter(|o| !o.is_empty())?;
        let user_id = self.user_id?;

        Some(HostCreateRequest {
            service_cluster_id: host.id,
            name: name.to_string(),
            user_id,
            os_type: os_type.to_string(),
            cpu_count: self.cpu_count,
            memory_size_mib: self.memory_size_mib,
            disk_size_gb: self.disk_size_gb,
            vm_offer_id: self.vm_offer_id,
            system_image_id: self.system_image_id,
            root_password: self.root_password.clone().filter(|p| !p.is_empty()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlacementOutcome {
    NoSuitableHost,
    Selected {
        host: ClusterHost,
        #[serde(skip_serializing_if = "Option::is_none")]
        vm_creation: Option<Value>,
    },
}

#[derive(Clone)]
pub struct PlacementService {
    inventory: HostInventory,
    client: HostAgentClient,
}

impl PlacementService {
    pub fn new(inventory: HostInventory, client: HostAgentClient) -> Self {
        Self { inventory, client }
    }

    pub fn inventory(&self) -> &HostInventory {
        &self.inventory
    }

    /// Pick a host and, with full VM parameters, have it create the VM.
    #[instrument(skip(self, req), fields(cpu = req.cpu_count, mem_mib = req.memory_size_mib, disk_gb = req.disk_size_gb))]
    pub async fn place(&self, req: &PlacementRequest) -> Result<PlacementOutcome> {
        req.validate()?;

        let hosts = self.inventory.list().await?;
        let Some(host) = ranking::select(&hosts, &req.requirement()) else {
            info!("No host satisfies the request among {} hosts", hosts.len());
            return Ok(PlacementOutcome::NoSuitableHost);
        };
        info!(host_id = host.id, "Selected host {}", host.ip);

        let vm_creation = match req.creation_for(host) {
            Some(create) => Some(self.client.create_vm(&host.ip, &create).await?),
            None => None,
        };

        Ok(PlacementOutcome::Selected {
            host: host.clone(),
            vm_creation,
        })
    }
}
