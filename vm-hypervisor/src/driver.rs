use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::transport::{ControlMethod, ControlTransport};

pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";
pub const ROOT_DRIVE_ID: &str = "rootfs";

/// Time between the graceful shutdown signal and the forced halt.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How long a freshly launched hypervisor gets to create its socket.
pub const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    #[serde(default)]
    pub smt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_dirty_pages: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalloonConfig {
    pub amount_mib: u32,
    pub deflate_on_oom: bool,
    pub stats_polling_interval_s: u32,
}

impl Default for BalloonConfig {
    fn default() -> Self {
        Self {
            amount_mib: 512,
            deflate_on_oom: true,
            stats_polling_interval_s: 1,
        }
    }
}

/// Everything needed to bring a configured-but-idle hypervisor to a booted guest.
#[derive(Debug, Clone)]
pub struct BootPlan {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
    pub rootfs_path: PathBuf,
    pub rootfs_read_only: bool,
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
    pub balloon: BalloonConfig,
}

#[derive(Debug, Clone, Copy)]
enum Action {
    InstanceStart,
    SendCtrlAltDel,
    InstanceHalt,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::InstanceStart => "InstanceStart",
            Action::SendCtrlAltDel => "SendCtrlAltDel",
            Action::InstanceHalt => "InstanceHalt",
        }
    }
}

/// Driver for a single hypervisor instance, addressed by its control socket.
///
/// Every call returns the raw response body on success. A non-2xx answer
/// becomes [`DriverError::Rejected`] carrying that body, and a multi-step
/// sequence stops at the first rejection.
#[derive(Clone)]
pub struct HypervisorDriver {
    transport: Arc<dyn ControlTransport>,
    socket_path: PathBuf,
    stop_grace: Duration,
}

impl HypervisorDriver {
    pub fn new(transport: Arc<dyn ControlTransport>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            socket_path: socket_path.into(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn set_machine_config(
        &self,
        vcpu_count: u32,
        mem_size_mib: u32,
        smt: bool,
    ) -> Result<String> {
        let body = json!({
            "vcpu_count": vcpu_count,
            "mem_size_mib": mem_size_mib,
            "smt": smt,
        });
        self.put("set_machine_config", "/machine-config", body).await
    }

    pub async fn set_boot_source(&self, kernel_image_path: &Path, boot_args: &str) -> Result<String> {
        let body = json!({
            "kernel_image_path": kernel_image_path.display().to_string(),
            "boot_args": boot_args,
        });
        self.put("set_boot_source", "/boot-source", body).await
    }

    pub async fn attach_root_drive(&self, path_on_host: &Path, read_only: bool) -> Result<String> {
        let body = json!({
            "drive_id": ROOT_DRIVE_ID,
            "path_on_host": path_on_host.display().to_string(),
            "is_root_device": true,
            "is_read_only": read_only,
        });
        self.put(
            "attach_root_drive",
            &format!("/drives/{}", ROOT_DRIVE_ID),
            body,
        )
        .await
    }

    pub async fn attach_network_interface(
        &self,
        iface_id: &str,
        guest_mac: &str,
        host_dev_name: &str,
    ) -> Result<String> {
        let body = json!({
            "iface_id": iface_id,
            "guest_mac": guest_mac,
            "host_dev_name": host_dev_name,
        });
        self.put(
            "attach_network_interface",
            &format!("/network-interfaces/{}", iface_id),
            body,
        )
        .await
    }

    pub async fn configure_balloon(&self, balloon: &BalloonConfig) -> Result<String> {
        let body = serde_json::to_value(balloon).map_err(|e| DriverError::InvalidResponse {
            operation: "configure_balloon",
            message: e.to_string(),
        })?;
        self.put("configure_balloon", "/balloon", body).await
    }

    pub async fn start(&self) -> Result<String> {
        self.action(Action::InstanceStart).await
    }

    /// Ask the guest to shut down, wait out the grace period, then halt.
    ///
    /// If the hypervisor has already exited (its socket is gone) once the
    /// grace period is over, the forced halt is skipped.
    #[instrument(skip(self), fields(socket = %self.socket_path.display()))]
    pub async fn stop(&self) -> Result<String> {
        let graceful = self.action(Action::SendCtrlAltDel).await?;
        debug!("Sent CtrlAltDel, waiting {:?}", self.stop_grace);

        sleep(self.stop_grace).await;

        if !self.socket_exists() {
            info!("Hypervisor exited during grace period");
            return Ok(graceful);
        }

        match self.action(Action::InstanceHalt).await {
            Ok(body) => Ok(body),
            Err(DriverError::Transport { .. }) if !self.socket_exists() => {
                info!("Hypervisor exited while halting");
                Ok(graceful)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn read_machine_config(&self) -> Result<MachineConfig> {
        let response = self
            .transport
            .request(&self.socket_path, ControlMethod::Get, "/machine-config", None)
            .await?;

        if !response.is_success() {
            return Err(DriverError::Rejected {
                operation: "read_machine_config",
                status: response.status,
                body: response.body,
            });
        }

        serde_json::from_str(&response.body).map_err(|e| DriverError::InvalidResponse {
            operation: "read_machine_config",
            message: e.to_string(),
        })
    }

    /// Replay the full configuration sequence in order.
    ///
    /// machine config, boot source, root drive, network interface, balloon.
    /// The first failing step aborts the remaining ones.
    #[instrument(skip(self, plan), fields(socket = %self.socket_path.display()))]
    pub async fn configure(&self, plan: &BootPlan) -> Result<()> {
        self.set_machine_config(plan.vcpu_count, plan.mem_size_mib, plan.smt)
            .await?;
        self.set_boot_source(&plan.kernel_image_path, &plan.boot_args)
            .await?;
        self.attach_root_drive(&plan.rootfs_path, plan.rootfs_read_only)
            .await?;
        self.attach_network_interface(&plan.iface_id, &plan.guest_mac, &plan.host_dev_name)
            .await?;
        self.configure_balloon(&plan.balloon).await?;

        info!("Hypervisor configured");
        Ok(())
    }

    /// Poll until the control socket exists.
    pub async fn wait_for_socket(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            if self.socket_exists() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "Control socket {} missing after {:?}",
                    self.socket_path.display(),
                    timeout
                );
                return Err(DriverError::SocketTimeout(self.socket_path.clone(), timeout));
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn action(&self, action: Action) -> Result<String> {
        self.put(
            action.as_str(),
            "/actions",
            json!({ "action_type": action.as_str() }),
        )
        .await
    }

    async fn put(&self, operation: &'static str, path: &str, body: Value) -> Result<String> {
        debug!(operation, path, "control request");

        let response = self
            .transport
            .request(&self.socket_path, ControlMethod::Put, path, Some(body))
            .await?;

        if response.is_success() {
            Ok(response.body)
        } else {
            warn!(
                operation,
                status = response.status,
                "Control request rejected: {}",
                response.body
            );
            Err(DriverError::Rejected {
                operation,
                status: response.status,
                body: response.body,
            })
        }
    }
}
