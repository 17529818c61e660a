//! Periodic capacity report to the placement service.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, System};
use tokio::time::interval;
use tracing::{error, info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// What the placement service needs to rank this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostReport {
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

fn to_gb(bytes: u64) -> i64 {
    (bytes as f64 / GIB).round() as i64
}

/// Sample this host. CPU usage is measured over a short window.
pub async fn collect_host_report(advertise_ip: Option<&str>) -> Result<HostReport> {
    let mut system = System::new_all();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_cpu();

    let name = System::host_name().unwrap_or_else(|| "unknown".to_string());
    let processor = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .or_else(System::cpu_arch)
        .unwrap_or_else(|| "Unknown".to_string());
    let core_count = system
        .physical_core_count()
        .unwrap_or_else(|| system.cpus().len()) as i64;

    let memory_total_gb = to_gb(system.total_memory());
    let memory_available_gb = to_gb(system.available_memory()).min(memory_total_gb);

    // the root filesystem holds the VM images; fall back to all disks
    let disks = Disks::new_with_refreshed_list();
    let (disk_total, disk_available) = match disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
    {
        Some(root) => (root.total_space(), root.available_space()),
        None => disks.list().iter().fold((0, 0), |(total, available), d| {
            (total + d.total_space(), available + d.available_space())
        }),
    };
    let disk_total_gb = to_gb(disk_total);
    let disk_available_gb = to_gb(disk_available).min(disk_total_gb);

    let usage = system.global_cpu_info().cpu_usage() as f64;
    let cpu_available_pct = (100.0 - usage).clamp(0.0, 100.0);

    let ip = match advertise_ip {
        Some(ip) => ip.to_string(),
        None => detect_ip().await,
    };

    Ok(HostReport {
        mac_address: primary_mac(&name),
        name,
        ip,
        processor,
        disk_total_gb,
        disk_available_gb,
        memory_total_gb,
        memory_available_gb,
        cpu_available_pct,
        core_count,
    })
}

/// Address of the interface that routes outwards. No packet is sent.
async fn detect_ip() -> String {
    let local = async {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        socket.local_addr()
    };
    match local.await {
        Ok(addr) => addr.ip().to_string(),
        Err(e) => {
            warn!("Cannot determine host IP ({}), using 127.0.0.1", e);
            "127.0.0.1".to_string()
        }
    }
}

/// MAC of the first physical-looking interface, by name. Hosts without
/// one get a stable locally administered address derived from the name.
fn primary_mac(host_name: &str) -> String {
    let networks = Networks::new_with_refreshed_list();
    let mut candidates: Vec<(&String, String)> = networks
        .iter()
        .filter(|(iface, data)| iface.as_str() != "lo" && !data.mac_address().is_unspecified())
        .map(|(iface, data)| (iface, data.mac_address().to_string()))
        .collect();
    candidates.sort();

    if let Some((_, mac)) = candidates.into_iter().next() {
        return mac;
    }

    let mut hasher = DefaultHasher::new();
    host_name.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]
    )
}

/// POST one report to `{cluster_host}/api/v1/hosts`.
pub async fn register_host(client: &Client, cluster_host: &str, report: &HostReport) -> Result<()> {
    let url = format!("{}/api/v1/hosts", cluster_host.trim_end_matches('/'));

    let response = client
        .post(&url)
        .json(report)
        .send()
        .await
        .with_context(|| format!("Failed to reach placement service at {}", url))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("Registration rejected ({}): {}", status, body));
    }

    info!(
        "Registered with placement service as {} ({}, {})",
        report.name, report.ip, report.mac_address
    );
    Ok(())
}

pub async fn start_registration_task(
    cluster_host: String,
    advertise_ip: Option<String>,
    interval_secs: u64,
) {
    let client = match Client::builder().timeout(REGISTRATION_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            error!("Cannot build registration client: {}", e);
            return;
        }
    };
    let mut interval = interval(Duration::from_secs(interval_secs.max(1)));

    info!(
        "Registration task running (reports every {} seconds to {})",
        interval_secs, cluster_host
    );

    loop {
        interval.tick().await;

        let result = async {
            let report = collect_host_report(advertise_ip.as_deref()).await?;
            register_host(&client, &cluster_host, &report).await
        }
        .await;

        if let Err(e) = result {
            error!("Host registration failed: {:#}", e);
        }
    }
}
