//! sqlx persistence for VM records and SSH keys.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;
use tracing::instrument;
use vm_network::NetworkIdentity;

use crate::error::{OrchestratorError, Result};
use crate::machine::{ProcessHandles, UsageCounters, VirtualMachine, VmStatus};
use crate::provision::VmPaths;

/// Fields written when a VM record is first inserted.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub user_id: i64,
    pub ssh_key_id: i64,
    pub name: String,
    pub os_type: String,
    pub vcpu_count: i64,
    pub memory_size_mib: i64,
    pub disk_size_gb: i64,
    pub boot_args: String,
    pub balloon_size_mib: i64,
    pub balloon_deflate_on_oom: bool,
    pub network_namespace: String,
    pub system_image_id: Option<i64>,
    pub vm_offer_id: Option<i64>,
    pub service_cluster_id: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SshKey {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub private_key: String,
}

#[derive(Clone)]
pub struct MachineStore {
    pool: SqlitePool,
}

impl MachineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_ssh_key(
        &self,
        user_id: i64,
        name: &str,
        public_key: &str,
        private_key: &str,
    ) -> Result<i64> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            "INSERT INTO ssh_keys (user_id, name, public_key, private_key, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(public_key)
        .bind(private_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_ssh_key(&self, id: i64) -> Result<SshKey> {
        let row = sqlx::query_as::<_, SshKeyRow>("SELECT * FROM ssh_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("ssh key {}", id)))?;

        Ok(row.into())
    }

    pub async fn delete_ssh_key(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM ssh_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a VM in `creating` state and return its id.
    ///
    /// The (owner, name) unique index turns a concurrent duplicate into
    /// [`OrchestratorError::Conflict`].
    #[instrument(skip(self, vm), fields(user_id = vm.user_id, name = %vm.name))]
    pub async fn insert_vm(&self, vm: &NewVm) -> Result<i64> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO virtual_machines (
                user_id, ssh_key_id, name, os_type, vcpu_count, memory_size_mib, disk_size_gb,
                boot_args, balloon_size_mib, balloon_deflate_on_oom, network_namespace, status,
                system_image_id, vm_offer_id, service_cluster_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(vm.user_id)
        .bind(vm.ssh_key_id)
        .bind(&vm.name)
        .bind(&vm.os_type)
        .bind(vm.vcpu_count)
        .bind(vm.memory_size_mib)
        .bind(vm.disk_size_gb)
        .bind(&vm.boot_args)
        .bind(vm.balloon_size_mib)
        .bind(vm.balloon_deflate_on_oom)
        .bind(&vm.network_namespace)
        .bind(VmStatus::Creating)
        .bind(vm.system_image_id)
        .bind(vm.vm_offer_id)
        .bind(vm.service_cluster_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return OrchestratorError::Conflict(format!(
                        "VM '{}' already exists for user {}",
                        vm.name, vm.user_id
                    ));
                }
            }
            OrchestratorError::Database(e)
        })?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<VirtualMachine> {
        self.find(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    pub async fn find(&self, id: i64) -> Result<Option<VirtualMachine>> {
        let row = sqlx::query_as::<_, VmRow>("SELECT * FROM virtual_machines WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn find_by_owner_and_name(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        let row = sqlx::query_as::<_, VmRow>(
            "SELECT * FROM virtual_machines WHERE user_id = ? AND name = ?",
        )
        .bind(user_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list(&self, user_id: Option<i64>) -> Result<Vec<VirtualMachine>> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query_as::<_, VmRow>(
                    "SELECT * FROM virtual_machines WHERE user_id = ? ORDER BY created_at DESC, id DESC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, VmRow>(
                    "SELECT * FROM virtual_machines ORDER BY created_at DESC, id DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// VMs currently in any of `statuses`, oldest first.
    pub async fn list_in_status(&self, statuses: &[VmStatus]) -> Result<Vec<VirtualMachine>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM virtual_machines WHERE status IN ({}) ORDER BY id",
            placeholders
        );
        let mut query = sqlx::query_as::<_, VmRow>(&sql);
        for status in statuses {
            query = query.bind(*status);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Persist network identity and process paths in one statement.
    pub async fn assign_network(
        &self,
        id: i64,
        network: &NetworkIdentity,
        paths: &VmPaths,
    ) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE virtual_machines
             SET tap_device_name = ?, tap_ip = ?, ip_address = ?, mac_address = ?,
                 socket_path = ?, log_path = ?, pid_file_path = ?,
                 kernel_image_path = ?, rootfs_path = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&network.tap_device)
        .bind(network.tap_ip.to_string())
        .bind(network.vm_ip.to_string())
        .bind(&network.mac)
        .bind(paths.socket_path.display().to_string())
        .bind(paths.log_path.display().to_string())
        .bind(paths.pid_file_path.display().to_string())
        .bind(paths.kernel_image_path.display().to_string())
        .bind(paths.rootfs_path.display().to_string())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_status(&self, id: i64, status: VmStatus) -> Result<()> {
        let now = Utc::now().timestamp();

        let result =
            sqlx::query("UPDATE virtual_machines SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_running(&self, id: i64, pid: Option<i64>) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE virtual_machines
             SET status = ?, pid = ?, last_start_time = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(VmStatus::Running)
        .bind(pid)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_stopped(&self, id: i64) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE virtual_machines
             SET status = ?, pid = NULL, last_stop_time = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(VmStatus::Stopped)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a VM to `error` and keep the diagnostic text.
    pub async fn mark_error(&self, id: i64, message: &str) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE virtual_machines
             SET status = ?, last_error_message = ?, last_error_time = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(VmStatus::Error)
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failure without touching the status.
    pub async fn record_error(&self, id: i64, message: &str) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE virtual_machines
             SET last_error_message = ?, last_error_time = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_usage(&self, id: i64, usage: &UsageCounters) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            "UPDATE virtual_machines
             SET cpu_usage_percent = COALESCE(?, cpu_usage_percent),
                 memory_usage_mib = COALESCE(?, memory_usage_mib),
                 disk_usage_bytes = COALESCE(?, disk_usage_bytes),
                 network_rx_bytes = COALESCE(?, network_rx_bytes),
                 network_tx_bytes = COALESCE(?, network_tx_bytes),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(usage.cpu_usage_percent)
        .bind(usage.memory_usage_mib)
        .bind(usage.disk_usage_bytes)
        .bind(usage.network_rx_bytes)
        .bind(usage.network_tx_bytes)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a VM record together with the key pair it owns.
    pub async fn delete_vm(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let key_id: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT ssh_key_id FROM virtual_machines WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((key_id,)) = key_id else {
            return Err(OrchestratorError::NotFound(id.to_string()));
        };

        sqlx::query("DELETE FROM virtual_machines WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if let Some(key_id) = key_id {
            sqlx::query("DELETE FROM ssh_keys WHERE id = ?")
                .bind(key_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct VmRow {
    id: i64,
    user_id: i64,
    ssh_key_id: Option<i64>,
    name: String,
    os_type: String,
    vcpu_count: i64,
    memory_size_mib: i64,
    disk_size_gb: i64,
    kernel_image_path: Option<String>,
    rootfs_path: Option<String>,
    boot_args: String,
    allow_mmds_requests: bool,
    track_dirty_pages: bool,
    balloon_size_mib: i64,
    balloon_deflate_on_oom: bool,
    mac_address: Option<String>,
    ip_address: Option<String>,
    tap_device_name: Option<String>,
    tap_ip: Option<String>,
    network_namespace: Option<String>,
    ssh_port: i64,
    status: VmStatus,
    socket_path: Option<String>,
    log_path: Option<String>,
    pid_file_path: Option<String>,
    pid: Option<i64>,
    last_start_time: Option<i64>,
    last_stop_time: Option<i64>,
    last_error_time: Option<i64>,
    last_error_message: Option<String>,
    cpu_usage_percent: Option<f64>,
    memory_usage_mib: Option<i64>,
    disk_usage_bytes: Option<i64>,
    network_rx_bytes: Option<i64>,
    network_tx_bytes: Option<i64>,
    system_image_id: Option<i64>,
    vm_offer_id: Option<i64>,
    service_cluster_id: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct SshKeyRow {
    id: i64,
    user_id: i64,
    name: String,
    public_key: String,
    private_key: String,
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

impl From<VmRow> for VirtualMachine {
    fn from(row: VmRow) -> Self {
        // Network identity is either complete or absent.
        let network = match (
            row.tap_device_name,
            row.tap_ip.and_then(|ip| ip.parse().ok()),
            row.ip_address.and_then(|ip| ip.parse().ok()),
            row.mac_address,
        ) {
            (Some(tap_device), Some(tap_ip), Some(vm_ip), Some(mac)) => Some(NetworkIdentity {
                tap_device,
                tap_ip,
                vm_ip,
                mac,
            }),
            _ => None,
        };

        let process = match (row.socket_path, row.log_path, row.pid_file_path) {
            (Some(socket_path), Some(log_path), Some(pid_file_path)) => Some(ProcessHandles {
                socket_path: PathBuf::from(socket_path),
                log_path: PathBuf::from(log_path),
                pid_file_path: PathBuf::from(pid_file_path),
                pid: row.pid,
            }),
            _ => None,
        };

        Self {
            id: row.id,
            user_id: row.user_id,
            ssh_key_id: row.ssh_key_id,
            name: row.name,
            os_type: row.os_type,
            vcpu_count: row.vcpu_count,
            memory_size_mib: row.memory_size_mib,
            disk_size_gb: row.disk_size_gb,
            kernel_image_path: row.kernel_image_path.map(PathBuf::from),
            rootfs_path: row.rootfs_path.map(PathBuf::from),
            boot_args: row.boot_args,
            allow_mmds_requests: row.allow_mmds_requests,
            track_dirty_pages: row.track_dirty_pages,
            balloon_size_mib: row.balloon_size_mib,
            balloon_deflate_on_oom: row.balloon_deflate_on_oom,
            network,
            network_namespace: row.network_namespace,
            ssh_port: row.ssh_port,
            status: row.status,
            process,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            last_start_time: row.last_start_time.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            last_stop_time: row.last_stop_time.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            last_error_time: row.last_error_time.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            last_error_message: row.last_error_message,
            usage: UsageCounters {
                cpu_usage_percent: row.cpu_usage_percent,
                memory_usage_mib: row.memory_usage_mib,
                disk_usage_bytes: row.disk_usage_bytes,
                network_rx_bytes: row.network_rx_bytes,
                network_tx_bytes: row.network_tx_bytes,
            },
            system_image_id: row.system_image_id,
            vm_offer_id: row.vm_offer_id,
            service_cluster_id: row.service_cluster_id,
        }
    }
}

impl From<SshKeyRow> for SshKey {
    fn from(row: SshKeyRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            public_key: row.public_key,
            private_key: row.private_key,
        }
    }
}
