//! Host selection.
//!
//! A host qualifies when every resource covers the request (`>=`). Among
//! qualifying hosts the one with the lowest mean free-to-total ratio wins,
//! which packs VMs onto busy hosts before touching idle ones. Ties keep
//! the order the hosts were given in.

use crate::host::ClusterHost;

/// CPU percentage assumed per requested core.
pub const CPU_PCT_PER_CORE: f64 = 10.0;

/// Resource requirement derived from a placement request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Requirement {
    pub cpu_count: i64,
    pub memory_gb: f64,
    pub disk_gb: i64,
    pub cpu_pct: f64,
}

impl Requirement {
    pub fn new(cpu_count: i64, memory_size_mib: i64, disk_size_gb: i64) -> Self {
        Self {
            cpu_count,
            memory_gb: memory_size_mib as f64 / 1024.0,
            disk_gb: disk_size_gb,
            cpu_pct: cpu_count as f64 * CPU_PCT_PER_CORE,
        }
    }
}

pub fn satisfies(host: &ClusterHost, req: &Requirement) -> bool {
    host.disk_available_gb >= req.disk_gb
        && host.memory_available_gb as f64 >= req.memory_gb
        && host.cpu_available_pct >= req.cpu_pct
        && host.core_count >= req.cpu_count
}

fn ratio(available: f64, total: f64) -> f64 {
    if total > 0.0 {
        available / total
    } else {
        0.0
    }
}

/// Mean of the disk, memory and CPU free ratios. Lower is busier.
pub fn free_ratio(host: &ClusterHost) -> f64 {
    (ratio(host.disk_available_gb as f64, host.disk_total_gb as f64)
        + ratio(
            host.memory_available_gb as f64,
            host.memory_total_gb as f64,
        )
        + host.cpu_available_pct / 100.0)
        / 3.0
}

/// Qualifying hosts, best candidate first.
pub fn rank<'a>(hosts: &'a [ClusterHost], req: &Requirement) -> Vec<&'a ClusterHost> {
    let mut candidates: Vec<&ClusterHost> = hosts.iter().filter(|h| satisfies(h, req)).collect();
    // sort_by is stable
    candidates.sort_by(|a, b| free_ratio(a).total_cmp(&free_ratio(b)));
    candidates
}

pub fn select<'a>(hosts: &'a [ClusterHost], req: &Requirement) -> Option<&'a ClusterHost> {
    rank(hosts, req).into_iter().next()
}
