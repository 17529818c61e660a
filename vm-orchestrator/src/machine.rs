use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use vm_network::NetworkIdentity;

use crate::error::{OrchestratorError, Result};

/// Lifecycle state of a VM.
///
/// ```text
/// creating -> created -> starting -> running -> stopping -> stopped
/// ```
/// `error` is reachable from every live state; `deleted` only from a
/// state with no hypervisor running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Creating,
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Deleted,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Creating => "creating",
            VmStatus::Created => "created",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Stopped => "stopped",
            VmStatus::Error => "error",
            VmStatus::Deleted => "deleted",
        }
    }

    pub fn can_transition_to(self, next: VmStatus) -> bool {
        use VmStatus::*;

        match (self, next) {
            (Deleted, _) => false,
            (_, Error) => true,
            (Creating, Created) => true,
            (Created | Stopped, Starting) => true,
            (Starting, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            // teardown failed, the hypervisor is still up
            (Stopping, Running) => true,
            (Error, Starting | Stopping) => true,
            (Created | Stopped | Error, Deleted) => true,
            _ => false,
        }
    }

    /// Check a transition, producing the error the controller reports.
    pub fn transition(self, next: VmStatus) -> Result<VmStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(OrchestratorError::InvalidState(format!(
                "cannot move from {} to {}",
                self, next
            )))
        }
    }

    /// Whether a hypervisor process may be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            VmStatus::Starting | VmStatus::Running | VmStatus::Stopping
        )
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem handles of the hypervisor process backing a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessHandles {
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub pid_file_path: PathBuf,
    pub pid: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_mib: Option<i64>,
    pub disk_usage_bytes: Option<i64>,
    pub network_rx_bytes: Option<i64>,
    pub network_tx_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: i64,
    pub user_id: i64,
    pub ssh_key_id: Option<i64>,
    pub name: String,
    pub os_type: String,

    pub vcpu_count: i64,
    pub memory_size_mib: i64,
    pub disk_size_gb: i64,

    pub kernel_image_path: Option<PathBuf>,
    pub rootfs_path: Option<PathBuf>,
    pub boot_args: String,
    pub allow_mmds_requests: bool,
    pub track_dirty_pages: bool,
    pub balloon_size_mib: i64,
    pub balloon_deflate_on_oom: bool,

    pub network: Option<NetworkIdentity>,
    pub network_namespace: Option<String>,
    pub ssh_port: i64,

    pub status: VmStatus,
    pub process: Option<ProcessHandles>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_stop_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,

    pub usage: UsageCounters,

    pub system_image_id: Option<i64>,
    pub vm_offer_id: Option<i64>,
    pub service_cluster_id: Option<i64>,
}

impl VirtualMachine {
    pub fn vm_ip(&self) -> Option<String> {
        self.network.as_ref().map(|n| n.vm_ip.to_string())
    }

    pub fn ssh_command(&self) -> Option<String> {
        self.vm_ip().map(|ip| ssh_command(&ip, self.ssh_port))
    }
}

pub fn ssh_command(vm_ip: &str, ssh_port: i64) -> String {
    if ssh_port == 22 {
        format!("ssh -i <private_key_file> root@{}", vm_ip)
    } else {
        format!("ssh -i <private_key_file> -p {} root@{}", ssh_port, vm_ip)
    }
}

/// Creation request, as forwarded by placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub user_id: i64,
    pub os_type: String,
    pub cpu_count: i64,
    pub memory_size_mib: i64,
    pub disk_size_gb: i64,
    #[serde(default)]
    pub service_cluster_id: Option<i64>,
    #[serde(default)]
    pub vm_offer_id: Option<i64>,
    #[serde(default)]
    pub system_image_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
}

const MIN_MEMORY_MIB: i64 = 128;

impl CreateVmRequest {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidInput(msg));

        let name = self.name.trim();
        if name.is_empty() {
            return invalid("name must not be empty".to_string());
        }
        if name.len() > 64 {
            return invalid("name must be at most 64 characters".to_string());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' '))
        {
            return invalid(format!(
                "name '{}' may only contain letters, digits, spaces, '-' and '_'",
                name
            ));
        }

        if self.os_type.is_empty()
            || self.os_type.starts_with('.')
            || !self
                .os_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return invalid(format!("invalid os_type '{}'", self.os_type));
        }

        if self.user_id <= 0 {
            return invalid("user_id must be positive".to_string());
        }
        if self.cpu_count <= 0 {
            return invalid("cpu_count must be at least 1".to_string());
        }
        if self.memory_size_mib < MIN_MEMORY_MIB {
            return invalid(format!(
                "memory_size_mib must be at least {}",
                MIN_MEMORY_MIB
            ));
        }
        if self.disk_size_gb <= 0 {
            return invalid("disk_size_gb must be at least 1".to_string());
        }
        if let Some(password) = &self.root_password {
            if password.is_empty() {
                return invalid("root_password must not be empty when given".to_string());
            }
        }

        Ok(())
    }
}

/// Network namespace name derived from a VM display name.
pub fn namespace_for(name: &str) -> String {
    format!("ns_{}", name.trim().to_lowercase().replace(' ', "-"))
}

pub(crate) fn serialize_datetime<S>(
    dt: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
