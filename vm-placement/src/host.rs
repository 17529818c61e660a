use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{info, instrument};

use crate::error::{PlacementError, Result};

/// A compute host as last reported by its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ClusterHost {
    pub id: i64,
    pub name: String,
    pub mac_address: String,
    pub ip: String,
    pub processor: String,
    pub disk_total_gb: i64,
    pub disk_available_gb: i64,
    pub memory_total_gb: i64,
    pub memory_available_gb: i64,
    pub cpu_available_pct: f64,
    pub core_count: i64,
}

/// Capacity report sent by a host agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRegistration {
    pub name: String,
    pub mac_address: String,
    pub ip: String,
    #[serde(default)]
    pub processor: String,
    pub disk_total_gb: i64,
    pub disk_available_gb: i64,
    pub memory_total_gb: i64,
    pub memory_available_gb: i64,
    pub cpu_available_pct: f64,
    pub core_count: i64,
}

impl HostRegistration {
    /// Available never exceeds total, nothing is negative.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PlacementError::InvalidInput(msg));

        if self.mac_address.trim().is_empty() {
            return invalid("mac_address must not be empty".to_string());
        }
        if self.ip.parse::<std::net::IpAddr>().is_err() {
            return invalid(format!("invalid ip '{}'", self.ip));
        }
        if self.disk_available_gb < 0 || self.disk_available_gb > self.disk_total_gb {
            return invalid(format!(
                "disk_available_gb {} outside 0..={}",
                self.disk_available_gb, self.disk_total_gb
            ));
        }
        if self.memory_available_gb < 0 || self.memory_available_gb > self.memory_total_gb {
            return invalid(format!(
                "memory_available_gb {} outside 0..={}",
                self.memory_available_gb, self.memory_total_gb
            ));
        }
        if !(0.0..=100.0).contains(&self.cpu_available_pct) {
            return invalid(format!(
                "cpu_available_pct {} outside 0..=100",
                self.cpu_available_pct
            ));
        }
        if self.core_count < 0 {
            return invalid("core_count must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct HostInventory {
    pool: SqlitePool,
}

impl HostInventory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a host or refresh the one with the same MAC address.
    #[instrument(skip(self, reg), fields(mac = %reg.mac_address))]
    pub async fn register(&self, reg: &HostRegistration) -> Result<ClusterHost> {
        reg.validate()?;
        let now = chrono::Utc::now().timestamp();

        let host = sqlx::query_as::<_, ClusterHost>(
            r#"
            INSERT INTO cluster_hosts (name, mac_address, ip, processor, disk_total_gb,
                                       disk_available_gb, memory_total_gb, memory_available_gb,
                                       cpu_available_pct, core_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(mac_address) DO UPDATE SET
                name = excluded.name,
                ip = excluded.ip,
                processor = excluded.processor,
                disk_total_gb = excluded.disk_total_gb,
                disk_available_gb = excluded.disk_available_gb,
                memory_total_gb = excluded.memory_total_gb,
                memory_available_gb = excluded.memory_available_gb,
                cpu_available_pct = excluded.cpu_available_pct,
                core_count = excluded.core_count,
                updated_at = excluded.updated_at
            RETURNING id, name, mac_address, ip, processor, disk_total_gb, disk_available_gb,
                      memory_total_gb, memory_available_gb, cpu_available_pct, core_count
            "#,
        )
        .bind(&reg.name)
        .bind(&reg.mac_address)
        .bind(&reg.ip)
        .bind(&reg.processor)
        .bind(reg.disk_total_gb)
        .bind(reg.disk_available_gb)
        .bind(reg.memory_total_gb)
        .bind(reg.memory_available_gb)
        .bind(reg.cpu_available_pct)
        .bind(reg.core_count)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!(host_id = host.id, "Host {} registered at {}", host.name, host.ip);
        Ok(host)
    }

    /// All hosts in registration order.
    pub async fn list(&self) -> Result<Vec<ClusterHost>> {
        let hosts = sqlx::query_as::<_, ClusterHost>(
            r#"
            SELECT id, name, mac_address, ip, processor, disk_total_gb, disk_available_gb,
                   memory_total_gb, memory_available_gb, cpu_available_pct, core_count
            FROM cluster_hosts
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(hosts)
    }

    pub async fn get(&self, id: i64) -> Result<ClusterHost> {
        sqlx::query_as::<_, ClusterHost>(
            r#"
            SELECT id, name, mac_address, ip, processor, disk_total_gb, disk_available_gb,
                   memory_total_gb, memory_available_gb, cpu_available_pct, core_count
            FROM cluster_hosts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PlacementError::NotFound(id.to_string()))
    }
}
