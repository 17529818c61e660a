use serde::{Deserialize, Serialize};
use std::path::Path;
use vm_hypervisor::MachineConfig;

use crate::machine::VmStatus;

/// Result of probing a VM against its record, the filesystem and the
/// control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LiveStatus {
    NotFound {
        vm_id: i64,
        reason: String,
    },
    Error {
        vm_id: i64,
        status: VmStatus,
        message: String,
    },
    Live {
        vm_id: i64,
        status: VmStatus,
        pid: Option<i64>,
        process_alive: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        machine_config: Option<MachineConfig>,
    },
}

impl LiveStatus {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LiveStatus::NotFound { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetrics {
    pub vm_id: i64,
    pub name: String,
    pub status: VmStatus,
    pub pid: i64,
    pub machine_config: MachineConfig,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_mib: Option<i64>,
    pub disk_usage_bytes: Option<i64>,
}

/// Read a pid file written by the hypervisor launcher.
pub fn read_pid_file(path: &Path) -> Option<i64> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|pid| *pid > 0)
}

/// Signal-0 liveness check.
pub fn process_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    i32::try_from(pid)
        .map(|pid| nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok())
        .unwrap_or(false)
}

/// CPU% and resident memory of a process, sampled over a short window.
pub async fn sample_process(pid: i64) -> (Option<f64>, Option<i64>) {
    use sysinfo::{Pid, System};

    let Ok(raw) = usize::try_from(pid) else {
        return (None, None);
    };
    let pid = Pid::from(raw);

    let mut system = System::new();
    if !system.refresh_process(pid) {
        return (None, None);
    }
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_process(pid);

    match system.process(pid) {
        Some(process) => (
            Some(process.cpu_usage() as f64),
            Some((process.memory() / 1024 / 1024) as i64),
        ),
        None => (None, None),
    }
}

/// Total size of the files directly inside `dir`.
pub fn directory_usage_bytes(dir: &Path) -> Option<i64> {
    let entries = std::fs::read_dir(dir).ok()?;
    let total: u64 = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum();
    i64::try_from(total).ok()
}
